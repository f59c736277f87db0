//! Tiered result caches.
//!
//! Three TTL'd LRU caches short-circuit pipeline work: `response` (full
//! pipeline results, keyed by a content hash over the call and audio
//! prefix), `transcript`, and `intent`. Entries are inserted only when
//! the producing chunk met the quality gate (transcript and response
//! both produced within the latency budget); the controller enforces
//! that gate.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use vigil_core::types::{Intent, PipelineResult};

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned a live entry.
    pub hits: u64,
    /// Lookups that missed or hit an expired entry.
    pub misses: u64,
    /// Entries dropped by TTL expiry.
    pub expired: u64,
}

impl CacheStats {
    /// Hit ratio in [0, 1]; zero when no lookups happened.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// An LRU cache whose entries expire after a TTL.
///
/// Expiry is lazy (checked on `get`) plus an explicit [`TtlCache::purge_expired`]
/// pass driven by the controller's cleanup loop.
pub struct TtlCache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// Create a cache holding up to `capacity` entries for `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Entry<V>>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Look up a key, honoring TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut cache = self.lock();
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                cache.pop(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value, refreshing its TTL.
    pub fn put(&self, key: String, value: V) {
        self.lock().put(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drop expired entries; returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let mut cache = self.lock();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        self.expired.fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Shrink capacity to `capacity`, evicting LRU entries as needed.
    pub fn resize(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        self.lock().resize(capacity);
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// The three pipeline caches.
pub struct CacheSet {
    /// Full pipeline results keyed by [`response_cache_key`].
    pub response: TtlCache<PipelineResult>,
    /// Transcripts keyed by audio content hash.
    pub transcript: TtlCache<String>,
    /// Intents keyed by transcript text hash.
    pub intent: TtlCache<Intent>,
}

impl CacheSet {
    /// Create the cache set with uniform capacity and TTL.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            response: TtlCache::new(capacity, ttl),
            transcript: TtlCache::new(capacity, ttl),
            intent: TtlCache::new(capacity, ttl),
        }
    }

    /// Clear every tier.
    pub fn clear_all(&self) {
        self.response.clear();
        self.transcript.clear();
        self.intent.clear();
    }

    /// Purge expired entries in every tier; returns the total removed.
    pub fn purge_expired(&self) -> usize {
        self.response.purge_expired() + self.transcript.purge_expired() + self.intent.purge_expired()
    }

    /// Shrink every tier to `capacity`.
    pub fn resize_all(&self, capacity: usize) {
        self.response.resize(capacity);
        self.transcript.resize(capacity);
        self.intent.resize(capacity);
    }
}

/// Number of leading payload bytes contributing to the response key.
const KEY_PREFIX_BYTES: usize = 256;

/// Content-address a chunk for the response cache.
///
/// Keyed over `callId`, a prefix of the audio payload, the sample rate,
/// and the channel count, so identical audio within one call hits.
#[must_use]
pub fn response_cache_key(
    call_id: &str,
    payload: &[u8],
    sample_rate: u32,
    channels: u8,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(call_id.as_bytes());
    hasher.update(&payload[..payload.len().min(KEY_PREFIX_BYTES)]);
    hasher.update(&sample_rate.to_le_bytes());
    hasher.update(&[channels]);
    hasher.finalize().to_hex().to_string()
}
