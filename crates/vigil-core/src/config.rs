//! Service configuration tree.
//!
//! One typed struct per subsystem, each with production defaults, rolled
//! up into [`VigilConfig`]. The composition root deserializes the tree
//! from JSON and threads the sub-configs into each component; nothing
//! reads configuration globally.

use serde::Deserialize;

/// Protocol and reliability layer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolConfig {
    /// Time to wait for an ack before retransmitting.
    pub ack_timeout_ms: u64,
    /// Retransmissions before a message is failed.
    pub max_retries: u32,
    /// Recently-seen envelope ids tracked per connection.
    pub dedup_window: usize,
    /// Payload size above which compression applies.
    pub compression_threshold_bytes: usize,
    /// Sweep interval for orphaned pending entries.
    pub orphan_sweep_interval_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_retries: 3,
            dedup_window: 1_024,
            compression_threshold_bytes: 8 * 1024,
            orphan_sweep_interval_ms: 30_000,
        }
    }
}

/// Signaling hub settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalConfig {
    /// Maximum peers per room.
    pub max_peers_per_room: usize,
    /// Maximum rooms a single user may hold.
    pub max_rooms_per_user: usize,
    /// Inactivity after which a peer is pinged.
    pub peer_timeout_ms: u64,
    /// Grace after the ping before the peer is terminated.
    pub peer_grace_ms: u64,
    /// Idle age after which an empty room is deleted.
    pub room_idle_max_ms: u64,
    /// Cleanup pass interval.
    pub cleanup_interval_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            max_peers_per_room: 4,
            max_rooms_per_user: 2,
            peer_timeout_ms: 30_000,
            peer_grace_ms: 10_000,
            room_idle_max_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Transport session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Prefer upgrading audio onto the media transport.
    pub prefer_media: bool,
    /// Fall back to the reliable transport when media fails.
    pub fallback_enabled: bool,
    /// Session idle timeout.
    pub idle_timeout_ms: u64,
    /// Heartbeat emission interval on the reliable transport.
    pub heartbeat_interval_ms: u64,
    /// Window within which a dropped connection may recover its session.
    pub recovery_window_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefer_media: true,
            fallback_enabled: true,
            idle_timeout_ms: 120_000,
            heartbeat_interval_ms: 15_000,
            recovery_window_ms: 30_000,
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Maximum total connections.
    pub max_connections: usize,
    /// Maximum connections per user.
    pub max_per_user: usize,
    /// Number of distinct priorities (0..P-1).
    pub priority_levels: u8,
    /// Enable the idle reuse cache.
    pub reuse_enabled: bool,
    /// Age below which a connection is never evicted.
    pub critical_window_ms: u64,
    /// Maximum evictions per acquire attempt.
    pub eviction_batch: usize,
    /// Default wait budget for queued acquire requests.
    pub waiter_timeout_ms: u64,
    /// Sweeper interval.
    pub cleanup_interval_ms: u64,
    /// Idle timeout for pooled connections (also reuse-cache TTL).
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            max_per_user: 3,
            priority_levels: 4,
            reuse_enabled: true,
            critical_window_ms: 10_000,
            eviction_batch: 2,
            waiter_timeout_ms: 10_000,
            cleanup_interval_ms: 30_000,
            idle_timeout_ms: 120_000,
        }
    }
}

/// Circuit breaker settings, shared by all stage dependencies.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Minimum recent calls before the breaker may open.
    pub volume_threshold: u32,
    /// Error percentage at or above which the breaker opens.
    pub error_threshold_percent: f64,
    /// Time the breaker stays open before probing.
    pub reset_timeout_ms: u64,
    /// Probe calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Sliding window length for recent call outcomes.
    pub window_size: usize,
    /// Deadline applied to each wrapped call.
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 10,
            error_threshold_percent: 50.0,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 3,
            window_size: 64,
            call_timeout_ms: 5_000,
        }
    }
}

/// Audio pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Maximum queued chunks per call before backpressure rejection.
    pub max_queue_size: usize,
    /// Nominal chunk payload size; preprocess rejects over 10x this.
    pub chunk_size_bytes: usize,
    /// Base VAD energy threshold.
    pub vad_base_threshold: f64,
    /// VAD hangover window in chunks.
    pub vad_hangover_chunks: u32,
    /// Messages before escalation to firm rejection.
    pub firm_rejection_after: u32,
    /// Messages before escalation to termination.
    pub termination_after: u32,
    /// Call duration before escalation to termination.
    pub termination_after_ms: u64,
    /// Recent transcripts/intents kept as classifier context.
    pub context_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 32,
            chunk_size_bytes: 16 * 1024,
            vad_base_threshold: 0.01,
            vad_hangover_chunks: 3,
            firm_rejection_after: 3,
            termination_after: 5,
            termination_after_ms: 120_000,
            context_window: 8,
        }
    }
}

/// Performance controller settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    /// Per-call ring buffer capacity.
    pub buffer_size: usize,
    /// Age beyond which buffered chunks are dropped.
    pub buffer_horizon_ms: u64,
    /// Ring utilization above which admission is delayed.
    pub backpressure_watermark: f64,
    /// Admission delay applied under backpressure.
    pub backpressure_delay_ms: u64,
    /// Entries per cache tier.
    pub cache_capacity: usize,
    /// Cache entry TTL.
    pub cache_ttl_ms: u64,
    /// Latency budget; also the cache quality gate.
    pub max_latency_ms: u64,
    /// Optimization loop interval.
    pub optimization_interval_ms: u64,
    /// Cooldown between global cache clears.
    pub optimization_cooldown_ms: u64,
    /// Rolling window length for latency and confidence samples.
    pub rolling_window: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            buffer_horizon_ms: 5_000,
            backpressure_watermark: 0.9,
            backpressure_delay_ms: 20,
            cache_capacity: 512,
            cache_ttl_ms: 60_000,
            max_latency_ms: 1_500,
            optimization_interval_ms: 10_000,
            optimization_cooldown_ms: 30_000,
            rolling_window: 32,
        }
    }
}

/// Latency / performance monitor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Samples retained per stage window.
    pub window_size: usize,
    /// Bottleneck factor applied to stage targets (p95 > factor * target).
    pub bottleneck_factor: f64,
    /// Resource sampling interval.
    pub sample_interval_ms: u64,
    /// CPU percentage alert threshold.
    pub cpu_alert_percent: f64,
    /// Memory percentage alert threshold.
    pub memory_alert_percent: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            bottleneck_factor: 1.5,
            sample_interval_ms: 5_000,
            cpu_alert_percent: 85.0,
            memory_alert_percent: 90.0,
        }
    }
}

/// User-facing session lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Maximum concurrent sessions per user.
    pub max_sessions_per_user: usize,
    /// Idle timeout before a session is reaped.
    pub idle_timeout_ms: u64,
    /// Absolute session lifetime.
    pub session_duration_ms: u64,
    /// Sweeper interval.
    pub cleanup_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 3,
            idle_timeout_ms: 900_000,
            session_duration_ms: 3_600_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Root configuration tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VigilConfig {
    /// Protocol and reliability settings.
    pub protocol: ProtocolConfig,
    /// Signaling hub settings.
    pub signal: SignalConfig,
    /// Transport session settings.
    pub transport: TransportConfig,
    /// Connection pool settings.
    pub pool: PoolConfig,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Audio pipeline settings.
    pub pipeline: PipelineConfig,
    /// Performance controller settings.
    pub performance: PerformanceConfig,
    /// Latency monitor settings.
    pub monitor: MonitorConfig,
    /// Session lifecycle settings.
    pub session: SessionConfig,
}
