//! The adaptive performance controller.
//!
//! One controller serves the whole process. It owns the per-call ring
//! buffers, the tiered caches, and the quality-tier state, and closes the
//! feedback loop: every emitted chunk feeds the call's rolling latency
//! window, which drives tier adaptation; any chunk over the latency
//! budget fires an optimization trigger (downgrade, cooldown-guarded
//! global cache clear, buffer compaction); a periodic loop watches the
//! global average and sheds load when the process as a whole runs hot.

use crate::cache::{CacheSet, CacheStats};
use crate::ring::ChunkRing;
use crate::tiers::{QualityTier, default_tiers};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use vigil_core::config::PerformanceConfig;
use vigil_core::types::{AudioChunk, CallId, PipelineResult, now_ms};

/// Events published by the controller.
#[derive(Debug, Clone)]
pub enum PerfEvent {
    /// A call moved to another quality tier.
    QualityChanged {
        /// Affected call.
        call_id: CallId,
        /// Previous tier name.
        from: &'static str,
        /// New tier name.
        to: &'static str,
    },
    /// A chunk exceeded the latency budget.
    OptimizationTriggered {
        /// Offending call.
        call_id: CallId,
        /// Observed chunk latency.
        latency_ms: u64,
    },
    /// The tiered caches were cleared globally.
    CachesCleared,
    /// Admission was delayed for a saturated call buffer.
    BackpressureApplied {
        /// Affected call.
        call_id: CallId,
    },
}

/// Per-call adaptive state.
struct CallPerf {
    ring: Arc<ChunkRing>,
    tier_index: usize,
    latency_window: VecDeque<u64>,
    confidence_window: VecDeque<f64>,
}

impl CallPerf {
    fn rolling_avg_latency(&self) -> Option<f64> {
        if self.latency_window.is_empty() {
            return None;
        }
        let sum: u64 = self.latency_window.iter().sum();
        Some(sum as f64 / self.latency_window.len() as f64)
    }
}

/// Process-wide adaptive performance controller.
pub struct PerformanceController {
    config: PerformanceConfig,
    tiers: Vec<QualityTier>,
    calls: DashMap<CallId, Mutex<CallPerf>>,
    /// The three result caches.
    pub caches: CacheSet,
    events: broadcast::Sender<PerfEvent>,
    last_cache_clear: Mutex<Option<Instant>>,
    compression_threshold: AtomicUsize,
    global_latency: Mutex<VecDeque<u64>>,
}

impl PerformanceController {
    /// Create a controller with the default tier list.
    #[must_use]
    pub fn new(config: PerformanceConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let caches = CacheSet::new(
            config.cache_capacity,
            Duration::from_millis(config.cache_ttl_ms),
        );
        Self {
            compression_threshold: AtomicUsize::new(8 * 1024),
            caches,
            tiers: default_tiers(),
            calls: DashMap::new(),
            events,
            last_cache_clear: Mutex::new(None),
            global_latency: Mutex::new(VecDeque::new()),
            config,
        }
    }

    /// Subscribe to controller events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PerfEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: PerfEvent) {
        let _ = self.events.send(event);
    }

    /// Register a call, creating its ring and tier state.
    ///
    /// Calls are registered lazily on first chunk; registering twice is a
    /// no-op.
    pub fn register_call(&self, call_id: &str) {
        self.calls.entry(call_id.to_string()).or_insert_with(|| {
            Mutex::new(CallPerf {
                ring: Arc::new(ChunkRing::new(self.config.buffer_size)),
                // New calls start at `high`, one below ultra, leaving an
                // upgrade step available immediately.
                tier_index: 1.min(self.tiers.len() - 1),
                latency_window: VecDeque::new(),
                confidence_window: VecDeque::new(),
            })
        });
    }

    /// Drop a finished call's state.
    pub fn remove_call(&self, call_id: &str) {
        self.calls.remove(call_id);
    }

    fn with_call<T>(&self, call_id: &str, f: impl FnOnce(&mut CallPerf) -> T) -> Option<T> {
        let entry = self.calls.get(call_id)?;
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
        Some(f(&mut state))
    }

    /// Ring buffer for a call.
    #[must_use]
    pub fn ring(&self, call_id: &str) -> Option<Arc<ChunkRing>> {
        self.with_call(call_id, |state| Arc::clone(&state.ring))
    }

    /// Apply admission backpressure when the call's ring is saturated.
    ///
    /// Sleeps for the configured delay when utilization exceeds the
    /// watermark; otherwise returns immediately.
    pub async fn admission_delay(&self, call_id: &str) {
        let saturated = self
            .with_call(call_id, |state| {
                state.ring.utilization() > self.config.backpressure_watermark
            })
            .unwrap_or(false);
        if saturated {
            self.publish(PerfEvent::BackpressureApplied {
                call_id: call_id.to_string(),
            });
            tracing::debug!("backpressure on call {call_id}");
            tokio::time::sleep(Duration::from_millis(self.config.backpressure_delay_ms)).await;
        }
    }

    /// Buffer a chunk into the call's ring, registering the call first if
    /// needed. Returns the displaced chunk on overrun.
    pub fn buffer_chunk(&self, chunk: AudioChunk) -> Option<AudioChunk> {
        self.register_call(&chunk.call_id);
        let call_id = chunk.call_id.clone();
        self.with_call(&call_id, |state| state.ring.push(chunk)).flatten()
    }

    /// Record an emitted chunk's latency and quality, then adapt.
    ///
    /// Adaptation per chunk: rolling average above the tier target moves
    /// one tier down; below half the target moves one tier up. A single
    /// chunk above the global latency budget fires the optimization
    /// trigger for the call.
    pub fn record_chunk(&self, call_id: &str, latency_ms: u64, confidence: f64) {
        self.register_call(call_id);
        let window = self.config.rolling_window.max(1);
        let adapt = self.with_call(call_id, |state| {
            state.latency_window.push_back(latency_ms);
            while state.latency_window.len() > window {
                state.latency_window.pop_front();
            }
            state.confidence_window.push_back(confidence);
            while state.confidence_window.len() > window {
                state.confidence_window.pop_front();
            }

            let avg = state.rolling_avg_latency().unwrap_or(0.0);
            let target = self.tiers[state.tier_index].latency_target_ms as f64;
            let from = state.tier_index;
            if avg > target && state.tier_index + 1 < self.tiers.len() {
                state.tier_index += 1;
            } else if avg < target * 0.5 && state.tier_index > 0 {
                state.tier_index -= 1;
            }
            (from, state.tier_index)
        });

        if let Some((from, to)) = adapt {
            if from != to {
                tracing::debug!(
                    "call {call_id} quality {} -> {}",
                    self.tiers[from].name,
                    self.tiers[to].name
                );
                self.publish(PerfEvent::QualityChanged {
                    call_id: call_id.to_string(),
                    from: self.tiers[from].name,
                    to: self.tiers[to].name,
                });
            }
        }

        {
            let mut global = self
                .global_latency
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            global.push_back(latency_ms);
            while global.len() > self.config.rolling_window.max(1) * 8 {
                global.pop_front();
            }
        }

        if latency_ms > self.config.max_latency_ms {
            self.optimization_trigger(call_id, latency_ms);
        }
    }

    /// React to a chunk over the latency budget: downgrade the call,
    /// clear caches globally (cooldown-guarded), compact buffers.
    fn optimization_trigger(&self, call_id: &str, latency_ms: u64) {
        tracing::info!("optimization triggered for {call_id} ({latency_ms}ms)");
        self.publish(PerfEvent::OptimizationTriggered {
            call_id: call_id.to_string(),
            latency_ms,
        });

        self.downgrade_call(call_id);

        let should_clear = {
            let mut last = self
                .last_cache_clear
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let cooldown = Duration::from_millis(self.config.optimization_cooldown_ms);
            match *last {
                Some(at) if at.elapsed() < cooldown => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if should_clear {
            self.caches.clear_all();
            self.publish(PerfEvent::CachesCleared);
        }

        self.compact_buffers();
    }

    /// Move a call one tier down, bounded at the lowest tier.
    pub fn downgrade_call(&self, call_id: &str) {
        let adapt = self.with_call(call_id, |state| {
            let from = state.tier_index;
            if state.tier_index + 1 < self.tiers.len() {
                state.tier_index += 1;
            }
            (from, state.tier_index)
        });
        if let Some((from, to)) = adapt {
            if from != to {
                self.publish(PerfEvent::QualityChanged {
                    call_id: call_id.to_string(),
                    from: self.tiers[from].name,
                    to: self.tiers[to].name,
                });
            }
        }
    }

    /// Drop stale chunks from every call's ring.
    pub fn compact_buffers(&self) {
        let now = now_ms();
        let horizon = self.config.buffer_horizon_ms;
        for entry in self.calls.iter() {
            let state = entry.lock().unwrap_or_else(|p| p.into_inner());
            let dropped = state.ring.drop_stale(now, horizon);
            if dropped > 0 {
                tracing::debug!("compacted {dropped} stale chunks for {}", entry.key());
            }
        }
    }

    /// Current tier of a call.
    #[must_use]
    pub fn tier(&self, call_id: &str) -> Option<QualityTier> {
        self.with_call(call_id, |state| self.tiers[state.tier_index].clone())
    }

    /// Current tier index of a call (0 = best).
    #[must_use]
    pub fn tier_index(&self, call_id: &str) -> Option<usize> {
        self.with_call(call_id, |state| state.tier_index)
    }

    /// Rolling average latency of a call, when samples exist.
    #[must_use]
    pub fn rolling_latency(&self, call_id: &str) -> Option<f64> {
        self.with_call(call_id, |state| state.rolling_avg_latency())
            .flatten()
    }

    /// Store a pipeline result behind the quality gate.
    ///
    /// Entries land in the caches only when the chunk produced both a
    /// transcript and a response within the latency budget.
    pub fn store_result(&self, key: &str, result: &PipelineResult) {
        let met_gate = result.transcript.is_some()
            && result.response.is_some()
            && result.processing_latency_ms <= self.config.max_latency_ms;
        if !met_gate {
            return;
        }
        self.caches.response.put(key.to_string(), result.clone());
        if let Some(transcript) = &result.transcript {
            self.caches.transcript.put(key.to_string(), transcript.clone());
            if let Some(intent) = &result.intent {
                let intent_key = blake3::hash(transcript.as_bytes()).to_hex().to_string();
                self.caches.intent.put(intent_key, intent.clone());
            }
        }
    }

    /// Response-cache lookup.
    #[must_use]
    pub fn cached_response(&self, key: &str) -> Option<PipelineResult> {
        self.caches.response.get(key)
    }

    /// Current envelope compression threshold in bytes.
    #[must_use]
    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold.load(Ordering::Relaxed)
    }

    /// One global optimization pass; returns true when load shedding ran.
    ///
    /// When the global average processing time exceeds 80% of the budget:
    /// shrink the caches, lower the compression threshold, and downgrade
    /// the worst-performing call.
    pub fn optimization_pass(&self) -> bool {
        let avg = {
            let global = self
                .global_latency
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if global.is_empty() {
                return false;
            }
            global.iter().sum::<u64>() as f64 / global.len() as f64
        };
        if avg <= self.config.max_latency_ms as f64 * 0.8 {
            return false;
        }

        let shrunk = (self.caches.response.capacity() * 3 / 4).max(16);
        self.caches.resize_all(shrunk);

        let threshold = self.compression_threshold.load(Ordering::Relaxed);
        self.compression_threshold
            .store((threshold * 3 / 4).max(1024), Ordering::Relaxed);

        // Downgrade the call with the worst rolling latency.
        let worst = self
            .calls
            .iter()
            .filter_map(|entry| {
                let state = entry.lock().unwrap_or_else(|p| p.into_inner());
                state
                    .rolling_avg_latency()
                    .map(|avg| (entry.key().clone(), avg))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((call_id, _)) = worst {
            self.downgrade_call(&call_id);
        }

        tracing::info!("global optimization pass: avg {avg:.0}ms, caches -> {shrunk}");
        true
    }

    /// One cache-maintenance pass: purge expired entries and log gauges.
    pub fn cleanup_pass(&self) -> usize {
        let purged = self.caches.purge_expired();
        let response = self.caches.response.stats();
        tracing::debug!(
            "cache cleanup: purged {purged}, response hit rate {:.2}",
            response.hit_rate()
        );
        purged
    }

    /// Spawn the periodic optimization and cleanup loops.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let optimize = {
            let controller = Arc::clone(self);
            let interval = Duration::from_millis(controller.config.optimization_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    controller.optimization_pass();
                }
            })
        };
        let cleanup = {
            let controller = Arc::clone(self);
            let interval = Duration::from_millis(controller.config.cache_ttl_ms.max(1_000));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    controller.cleanup_pass();
                }
            })
        };
        vec![optimize, cleanup]
    }

    /// Combined cache stats `(response, transcript, intent)`.
    #[must_use]
    pub fn cache_stats(&self) -> (CacheStats, CacheStats, CacheStats) {
        (
            self.caches.response.stats(),
            self.caches.transcript.stats(),
            self.caches.intent.stats(),
        )
    }

    /// Number of tracked calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::{AudioEncoding, Response, ResponseStrategy};

    fn test_config() -> PerformanceConfig {
        PerformanceConfig {
            buffer_size: 4,
            buffer_horizon_ms: 1_000,
            backpressure_watermark: 0.5,
            backpressure_delay_ms: 10,
            cache_capacity: 64,
            cache_ttl_ms: 60_000,
            max_latency_ms: 1_000,
            optimization_interval_ms: 60_000,
            optimization_cooldown_ms: 60_000,
            rolling_window: 4,
        }
    }

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk {
            id: format!("chunk-{seq}"),
            call_id: "call-1".into(),
            timestamp: now_ms(),
            sequence_number: seq,
            payload: vec![0; 4],
            sample_rate: 16_000,
            channel_count: 1,
            encoding: AudioEncoding::Pcm,
        }
    }

    fn good_result(latency: u64) -> PipelineResult {
        PipelineResult {
            chunk_id: "chunk-1".into(),
            call_id: "call-1".into(),
            timestamp: now_ms(),
            processing_latency_ms: latency,
            transcript: Some("hello".into()),
            intent: Some(vigil_core::types::Intent::unknown()),
            response: Some(Response {
                text: "no thanks".into(),
                should_terminate: false,
                confidence: 0.9,
                strategy: ResponseStrategy::PoliteDecline,
                response_audio: None,
            }),
            quality_metrics: Default::default(),
        }
    }

    #[test]
    fn test_register_and_default_tier() {
        let controller = PerformanceController::new(test_config());
        controller.register_call("call-1");
        assert_eq!(controller.tier("call-1").unwrap().name, "high");
        controller.register_call("call-1"); // idempotent
        assert_eq!(controller.call_count(), 1);
    }

    #[test]
    fn test_downgrade_on_sustained_latency() {
        let controller = PerformanceController::new(test_config());
        controller.register_call("call-1");
        // high tier target is 700ms; sustained 900ms forces a downgrade.
        for _ in 0..4 {
            controller.record_chunk("call-1", 900, 0.8);
        }
        assert_eq!(controller.tier("call-1").unwrap().name, "medium");
    }

    #[test]
    fn test_upgrade_on_low_latency() {
        let controller = PerformanceController::new(test_config());
        controller.register_call("call-1");
        // Well under half of high's 700ms target.
        for _ in 0..4 {
            controller.record_chunk("call-1", 100, 0.9);
        }
        assert_eq!(controller.tier("call-1").unwrap().name, "ultra");
        // Bounded at the top.
        for _ in 0..8 {
            controller.record_chunk("call-1", 50, 0.9);
        }
        assert_eq!(controller.tier_index("call-1"), Some(0));
    }

    #[test]
    fn test_tier_moves_one_step_at_a_time() {
        let controller = PerformanceController::new(test_config());
        controller.register_call("call-1");
        let before = controller.tier_index("call-1").unwrap();
        controller.record_chunk("call-1", 5_000, 0.1);
        let after = controller.tier_index("call-1").unwrap();
        // One adaptation step plus one trigger downgrade at most.
        assert!(after - before <= 2);
        assert!(after < default_tiers().len());
    }

    #[tokio::test]
    async fn test_optimization_trigger_clears_caches_once() {
        let controller = PerformanceController::new(test_config());
        let mut events = controller.subscribe();
        controller.register_call("call-1");
        controller.caches.transcript.put("k".into(), "v".into());

        controller.record_chunk("call-1", 2_000, 0.2);
        assert!(controller.caches.transcript.is_empty());

        // Second trigger inside the cooldown leaves caches alone.
        controller.caches.transcript.put("k".into(), "v".into());
        controller.record_chunk("call-1", 2_000, 0.2);
        assert!(!controller.caches.transcript.is_empty());

        let mut triggered = 0;
        let mut cleared = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                PerfEvent::OptimizationTriggered { .. } => triggered += 1,
                PerfEvent::CachesCleared => cleared += 1,
                _ => {}
            }
        }
        assert_eq!(triggered, 2);
        assert_eq!(cleared, 1);
    }

    #[tokio::test]
    async fn test_backpressure_delay_when_saturated() {
        let controller = PerformanceController::new(test_config());
        for seq in 0..4 {
            controller.buffer_chunk(chunk(seq));
        }
        let mut events = controller.subscribe();
        let start = Instant::now();
        controller.admission_delay("call-1").await;
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(matches!(
            events.try_recv().unwrap(),
            PerfEvent::BackpressureApplied { .. }
        ));

        // An unsaturated call is admitted immediately.
        controller.register_call("call-2");
        let start = Instant::now();
        controller.admission_delay("call-2").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_ring_overrun_accounted() {
        let controller = PerformanceController::new(test_config());
        for seq in 0..6 {
            controller.buffer_chunk(chunk(seq));
        }
        let ring = controller.ring("call-1").unwrap();
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.overruns(), 2);
    }

    #[test]
    fn test_quality_gate_on_store() {
        let controller = PerformanceController::new(test_config());

        // Slow chunk fails the gate.
        controller.store_result("key-slow", &good_result(5_000));
        assert!(controller.cached_response("key-slow").is_none());

        // Silence fails the gate.
        let silence = PipelineResult::silence("chunk-s", "call-1", 10);
        controller.store_result("key-silence", &silence);
        assert!(controller.cached_response("key-silence").is_none());

        // Fast full result is stored.
        controller.store_result("key-good", &good_result(200));
        let hit = controller.cached_response("key-good").unwrap();
        assert_eq!(hit.transcript.as_deref(), Some("hello"));
    }

    #[test]
    fn test_global_optimization_pass() {
        let controller = PerformanceController::new(test_config());
        controller.register_call("call-1");
        let cap_before = controller.caches.response.capacity();
        let threshold_before = controller.compression_threshold();

        // Cold: no samples, no shedding.
        assert!(!controller.optimization_pass());

        // Hot: sustained latency over 80% of budget.
        for _ in 0..8 {
            controller.record_chunk("call-1", 900, 0.5);
        }
        assert!(controller.optimization_pass());
        assert!(controller.caches.response.capacity() < cap_before);
        assert!(controller.compression_threshold() < threshold_before);
    }

    #[test]
    fn test_remove_call() {
        let controller = PerformanceController::new(test_config());
        controller.register_call("call-1");
        controller.remove_call("call-1");
        assert_eq!(controller.call_count(), 0);
        assert!(controller.tier("call-1").is_none());
    }
}
