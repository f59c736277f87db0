//! # VIGIL Performance
//!
//! Adaptive performance control for the voice pipeline.
//!
//! This crate provides:
//! - Per-call bounded [`ring`] buffers with overrun accounting
//! - A multi-tier TTL'd LRU [`cache`] (response / transcript / intent)
//! - Ordered quality [`tiers`] with per-call adaptation
//! - The [`controller`] tying buffers, caches and tiers into a feedback
//!   loop with backpressure and optimization triggers
//! - The latency / bottleneck [`monitor`] publishing advice, never action
//!
//! The controller observes every emitted chunk; latency above the budget
//! downgrades the call's quality tier, clears caches (cooldown-guarded),
//! and compacts buffers. Latency well under budget upgrades one step at a
//! time. Tier changes select the outbound codec by bitrate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod controller;
pub mod monitor;
pub mod ring;
pub mod tiers;

pub use cache::{CacheSet, CacheStats, TtlCache, response_cache_key};
pub use controller::{PerfEvent, PerformanceController};
pub use monitor::{Bottleneck, BottleneckReport, LatencyMonitor, MonitorEvent, StageSummary};
pub use ring::ChunkRing;
pub use tiers::{QualityTier, codec_for_bitrate, default_tiers};
