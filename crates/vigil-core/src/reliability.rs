//! At-least-once delivery with duplicate suppression.
//!
//! The reliability layer sits between the transport and the handler
//! registry. On send it assigns per-connection sequence numbers and parks
//! ack-requiring envelopes in a pending map with a retransmission timer.
//! On receive it validates, suppresses duplicates, emits acks before
//! dispatch, and resolves pending entries when acks arrive.
//!
//! # Delivery flow
//!
//! ```text
//! Sender                               Receiver
//!    |-- envelope (ackRequired) --------->| validate, dedup
//!    |                                    | ack (same id) before dispatch
//!    |<-- ack ----------------------------|
//!    | resolve pending, record latency    |
//!    |                                    |
//!    |-- envelope ------------------(lost)|
//!    | ackTimeout fires, retry += 1       |
//!    |-- envelope (retry=1) ------------->| duplicate? suppress + count
//! ```
//!
//! Acks reuse the acknowledged id, are never themselves tracked, and are
//! exempt from the duplicate window (the original id is already in it).

use crate::config::ProtocolConfig;
use crate::envelope::{Envelope, MessageType};
use crate::error::{CoreError, Result};
use crate::events::{EventBus, ProtocolEvent};
use crate::registry::{HandlerOutcome, HandlerRegistry};
use crate::types::ConnectionId;
use dashmap::DashMap;
use lru::LruCache;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Future returned by a [`SendFn`].
pub type SendFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// Transport send callback: takes a serialized frame, resolves when the
/// frame is on the wire. Errors are opaque strings at this seam.
pub type SendFn = Arc<dyn Fn(String) -> SendFuture + Send + Sync>;

/// Reliability tuning derived from [`ProtocolConfig`].
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Time to wait for an ack before retransmitting.
    pub ack_timeout: Duration,
    /// Retransmissions before the message is failed.
    pub max_retries: u32,
    /// Recently-seen ids tracked per connection.
    pub dedup_window: usize,
    /// Payload size above which compression applies.
    pub compression_threshold: usize,
}

impl From<&ProtocolConfig> for ReliabilityConfig {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            max_retries: config.max_retries,
            dedup_window: config.dedup_window,
            compression_threshold: config.compression_threshold_bytes,
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

/// A sent envelope awaiting acknowledgement.
struct PendingEntry {
    envelope: Envelope,
    connection_id: ConnectionId,
    sent_at: Instant,
    retries: u32,
    send: SendFn,
    timer: JoinHandle<()>,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Counter snapshot for the reliability layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReliabilityStats {
    /// Envelopes sent (first transmissions).
    pub messages_sent: u64,
    /// Envelopes received and validated.
    pub messages_received: u64,
    /// Acks resolved against pending entries.
    pub acks_received: u64,
    /// Retransmissions performed.
    pub retransmissions: u64,
    /// Messages failed after the retry budget.
    pub delivery_failures: u64,
    /// Duplicate envelope ids suppressed.
    pub duplicates_detected: u64,
    /// Frames dropped for parse or shape failures.
    pub validation_failures: u64,
    /// Frames dropped for checksum mismatch.
    pub integrity_failures: u64,
    /// Frames dropped for exceeded TTL.
    pub expired_dropped: u64,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    acks_received: AtomicU64,
    retransmissions: AtomicU64,
    delivery_failures: AtomicU64,
    duplicates_detected: AtomicU64,
    validation_failures: AtomicU64,
    integrity_failures: AtomicU64,
    expired_dropped: AtomicU64,
}

/// At-least-once delivery layer with ack tracking and dedup.
///
/// Thread-safe; share via `Arc`. One instance serves all connections.
pub struct ReliabilityLayer {
    config: ReliabilityConfig,
    pending: Arc<DashMap<String, PendingEntry>>,
    seen: DashMap<ConnectionId, Mutex<LruCache<String, ()>>>,
    sequences: DashMap<ConnectionId, AtomicU64>,
    counters: Arc<Counters>,
    events: EventBus,
}

impl ReliabilityLayer {
    /// Create a reliability layer publishing to `events`.
    #[must_use]
    pub fn new(config: ReliabilityConfig, events: EventBus) -> Self {
        Self {
            config,
            pending: Arc::new(DashMap::new()),
            seen: DashMap::new(),
            sequences: DashMap::new(),
            counters: Arc::new(Counters::default()),
            events,
        }
    }

    /// Next sequence number for a connection.
    fn next_sequence(&self, connection_id: &ConnectionId) -> u64 {
        self.sequences
            .entry(connection_id.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Send an envelope over `send`, tracking it when it needs an ack.
    ///
    /// Assigns the per-connection sequence number, serializes, and
    /// transmits. Envelopes with `ackRequired` (or priority at or above
    /// high) are parked in the pending map with a retransmission timer.
    ///
    /// # Errors
    /// Fails when serialization fails or the transport rejects the frame.
    pub async fn send(
        &self,
        mut envelope: Envelope,
        connection_id: &ConnectionId,
        send: SendFn,
    ) -> Result<()> {
        envelope.sequence_number = Some(self.next_sequence(connection_id));
        let frame = envelope.encode_with_threshold(self.config.compression_threshold)?;

        send(frame).await.map_err(CoreError::Send)?;
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);

        if envelope.needs_ack() {
            self.track(envelope, connection_id.clone(), send);
        }
        Ok(())
    }

    /// Park an envelope in the pending map and start its timer.
    fn track(&self, envelope: Envelope, connection_id: ConnectionId, send: SendFn) {
        let id = envelope.id.clone();
        let timer = self.spawn_retransmit_timer(id.clone());
        self.pending.insert(
            id,
            PendingEntry {
                envelope,
                connection_id,
                sent_at: Instant::now(),
                retries: 0,
                send,
                timer,
            },
        );
    }

    /// Spawn the per-message retransmission loop.
    fn spawn_retransmit_timer(&self, id: String) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let counters = Arc::clone(&self.counters);
        let events = self.events.clone();
        let ack_timeout = self.config.ack_timeout;
        let max_retries = self.config.max_retries;
        let threshold = self.config.compression_threshold;

        tokio::spawn(async move {
            use rand::{Rng, SeedableRng};
            let mut rng = rand::rngs::SmallRng::from_entropy();
            loop {
                // Jitter retransmissions so synchronized senders fan out.
                let jitter_ceiling = (ack_timeout.as_millis() as u64 / 10).max(1);
                let jitter = Duration::from_millis(rng.gen_range(0..jitter_ceiling));
                tokio::time::sleep(ack_timeout + jitter).await;

                // Re-serialize under the lock, send outside it.
                let attempt = {
                    let Some(mut entry) = pending.get_mut(&id) else {
                        return; // acked meanwhile
                    };
                    if entry.retries >= max_retries {
                        None
                    } else {
                        entry.retries += 1;
                        entry.envelope.retry = entry.retries;
                        let frame = entry.envelope.encode_with_threshold(threshold);
                        Some((frame, Arc::clone(&entry.send), entry.retries))
                    }
                };

                match attempt {
                    Some((Ok(frame), send, retries)) => {
                        counters.retransmissions.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("retransmitting {id} (attempt {retries})");
                        if let Err(e) = send(frame).await {
                            tracing::warn!("retransmit send failed for {id}: {e}");
                        }
                    }
                    Some((Err(e), _, _)) => {
                        tracing::error!("re-serialization failed for {id}: {e}");
                        // Fall through to failure on the next tick.
                    }
                    None => {
                        if let Some((_, entry)) = pending.remove(&id) {
                            counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                "delivery of {id} failed after {} retries",
                                entry.retries
                            );
                            events.publish(ProtocolEvent::MessageFailed {
                                id: id.clone(),
                                connection_id: entry.connection_id.clone(),
                                retries: entry.retries,
                            });
                        }
                        return;
                    }
                }
            }
        })
    }

    /// Resolve a pending entry against an incoming ack.
    fn on_ack(&self, ack: &Envelope) {
        if let Some((_, entry)) = self.pending.remove(&ack.id) {
            let latency_ms = entry.sent_at.elapsed().as_millis() as u64;
            self.counters.acks_received.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("ack for {} after {latency_ms}ms", ack.id);
            self.events.publish(ProtocolEvent::MessageAcked {
                id: ack.id.clone(),
                ack_latency_ms: latency_ms,
            });
        }
    }

    /// Record an id in the per-connection window; true when already seen.
    fn is_duplicate(&self, connection_id: &ConnectionId, id: &str) -> bool {
        let window = self.seen.entry(connection_id.clone()).or_insert_with(|| {
            let capacity =
                NonZeroUsize::new(self.config.dedup_window.max(1)).unwrap_or(NonZeroUsize::MIN);
            Mutex::new(LruCache::new(capacity))
        });
        let mut cache = window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.put(id.to_string(), ()).is_some()
    }

    /// Process one inbound frame end to end.
    ///
    /// Validation failures are counted and surfaced as events, then
    /// returned to the caller. Acks resolve pending entries and return
    /// `None`. Duplicates return `None` after incrementing
    /// `duplicates_detected`. Otherwise an ack is emitted (when requested)
    /// before the registry dispatch, and the handler outcome is returned.
    ///
    /// # Errors
    /// Returns the validation error for malformed, tampered, or expired
    /// frames; the frame is dropped in every such case.
    pub async fn receive(
        &self,
        frame: &str,
        connection_id: &ConnectionId,
        reply: SendFn,
        registry: &HandlerRegistry,
    ) -> Result<Option<HandlerOutcome>> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let kind = e.kind();
                match e {
                    CoreError::ChecksumMismatch { .. } => {
                        self.counters.integrity_failures.fetch_add(1, Ordering::Relaxed);
                    }
                    CoreError::Expired(_) => {
                        self.counters.expired_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.events.publish(ProtocolEvent::InvalidMessage {
                    kind: kind.as_str(),
                    connection_id: connection_id.clone(),
                });
                return Err(e);
            }
        };

        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        // Acks are terminal here: no dedup, no dispatch.
        if envelope.message_type() == MessageType::Ack {
            self.on_ack(&envelope);
            return Ok(None);
        }

        if self.is_duplicate(connection_id, &envelope.id) {
            self.counters.duplicates_detected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("duplicate {} on {connection_id}", envelope.id);
            self.events.publish(ProtocolEvent::DuplicateSuppressed {
                id: envelope.id.clone(),
                connection_id: connection_id.clone(),
            });
            return Ok(None);
        }

        // Ack before dispatch, per protocol.
        if envelope.ack_required {
            let ack = Envelope::ack_for(&envelope, connection_id.clone());
            let frame = ack.encode_with_threshold(self.config.compression_threshold)?;
            if let Err(e) = reply(frame).await {
                tracing::warn!("ack send failed for {}: {e}", envelope.id);
            }
        }

        Ok(registry.dispatch(&envelope, connection_id).await)
    }

    /// Fail pending entries that outlived `ackTimeout * (maxRetries + 1)`.
    ///
    /// Covers entries whose timer task died; normally the timers fail
    /// messages first.
    pub fn sweep_orphans(&self) -> usize {
        let horizon = self.config.ack_timeout * (self.config.max_retries + 1);
        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.sent_at.elapsed() > horizon)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = 0;
        for id in orphaned {
            if let Some((_, entry)) = self.pending.remove(&id) {
                swept += 1;
                self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                self.events.publish(ProtocolEvent::MessageFailed {
                    id,
                    connection_id: entry.connection_id.clone(),
                    retries: entry.retries,
                });
            }
        }
        if swept > 0 {
            tracing::info!("swept {swept} orphaned pending messages");
        }
        swept
    }

    /// Spawn the periodic orphan sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let layer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                layer.sweep_orphans();
            }
        })
    }

    /// Drop all per-connection state for a closed connection.
    pub fn forget_connection(&self, connection_id: &ConnectionId) {
        self.seen.remove(connection_id);
        self.sequences.remove(connection_id);
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.connection_id == *connection_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.pending.remove(&id);
        }
    }

    /// Number of envelopes awaiting acknowledgement.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> ReliabilityStats {
        ReliabilityStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            acks_received: self.counters.acks_received.load(Ordering::Relaxed),
            retransmissions: self.counters.retransmissions.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
            duplicates_detected: self.counters.duplicates_detected.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            integrity_failures: self.counters.integrity_failures.load(Ordering::Relaxed),
            expired_dropped: self.counters.expired_dropped.load(Ordering::Relaxed),
        }
    }
}
