//! Latency and resource monitor.
//!
//! Keeps a bounded sliding window of samples per pipeline stage and
//! computes count / mean / min / max / p50 / p95 / p99. A stage whose p95
//! exceeds `bottleneck_factor` times its target is a bottleneck; the
//! monitor publishes a ranked report with stage-specific recommendations
//! and never takes action itself. Resource gauges (CPU%, memory%) are fed
//! by the composition root and alert over their thresholds.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;
use vigil_core::config::MonitorConfig;

/// Pipeline stage names the monitor knows targets for.
pub const STAGES: [&str; 6] = [
    "preprocess",
    "vad",
    "recognize",
    "intent",
    "respond",
    "synthesize",
];

/// Percentile summary of one stage window.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSummary {
    /// Stage name.
    pub stage: String,
    /// Samples in the window.
    pub count: usize,
    /// Mean latency in ms.
    pub mean: f64,
    /// Minimum latency in ms.
    pub min: u64,
    /// Maximum latency in ms.
    pub max: u64,
    /// Median latency in ms.
    pub p50: u64,
    /// 95th percentile latency in ms.
    pub p95: u64,
    /// 99th percentile latency in ms.
    pub p99: u64,
}

/// One detected bottleneck.
#[derive(Debug, Clone, PartialEq)]
pub struct Bottleneck {
    /// Offending stage.
    pub stage: String,
    /// Observed p95.
    pub p95_ms: u64,
    /// Stage latency target.
    pub target_ms: u64,
    /// Advice for the operator; the monitor never acts on it.
    pub recommendations: &'static [&'static str],
}

/// Ranked bottleneck report, worst first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BottleneckReport {
    /// Bottlenecks ordered by overshoot ratio, descending.
    pub bottlenecks: Vec<Bottleneck>,
}

/// Events published by the monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// One or more stages exceed their latency targets.
    BottlenecksDetected(BottleneckReport),
    /// A resource gauge crossed its alert threshold.
    ResourceAlert {
        /// CPU usage percentage.
        cpu_percent: f64,
        /// Memory usage percentage.
        memory_percent: f64,
    },
}

/// Stage-specific recommendation sets.
fn recommendations_for(stage: &str) -> &'static [&'static str] {
    match stage {
        "recognize" => &[
            "enable_streaming",
            "pool_connections",
            "cache_transcripts",
            "reduce_chunk_size",
        ],
        "intent" => &["cache_classifications", "reduce_prompt", "predictive_pipeline"],
        "respond" => &[
            "enlarge_pool",
            "cache_templates",
            "stream_response",
            "shorten_prompt",
        ],
        "synthesize" => &["cache_responses", "pool_connections", "pre_generate_common"],
        // preprocess and vad share the preprocessing advice.
        _ => &["cache_features", "parallelize", "simplify_vad"],
    }
}

/// Default per-stage latency targets in ms.
fn default_targets() -> HashMap<String, u64> {
    HashMap::from([
        ("preprocess".to_string(), 50),
        ("vad".to_string(), 20),
        ("recognize".to_string(), 400),
        ("intent".to_string(), 300),
        ("respond".to_string(), 400),
        ("synthesize".to_string(), 300),
    ])
}

/// Per-stage sliding-window latency monitor.
pub struct LatencyMonitor {
    config: MonitorConfig,
    windows: DashMap<String, Mutex<VecDeque<u64>>>,
    targets: HashMap<String, u64>,
    events: broadcast::Sender<MonitorEvent>,
}

impl LatencyMonitor {
    /// Create a monitor with the default stage targets.
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            windows: DashMap::new(),
            targets: default_targets(),
            events,
        }
    }

    /// Subscribe to monitor events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Record one stage sample.
    pub fn record_stage(&self, stage: &str, latency_ms: u64) {
        let window = self
            .windows
            .entry(stage.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut samples = window.lock().unwrap_or_else(|p| p.into_inner());
        samples.push_back(latency_ms);
        while samples.len() > self.config.window_size.max(1) {
            samples.pop_front();
        }
    }

    /// Percentile summary for a stage, when it has samples.
    #[must_use]
    pub fn summary(&self, stage: &str) -> Option<StageSummary> {
        let window = self.windows.get(stage)?;
        let samples = window.lock().unwrap_or_else(|p| p.into_inner());
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        Some(StageSummary {
            stage: stage.to_string(),
            count,
            mean: sum as f64 / count as f64,
            min: sorted[0],
            max: sorted[count - 1],
            p50: percentile(&sorted, 0.50),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
        })
    }

    /// Detect bottlenecks across all stages, publishing the report when
    /// any exist.
    #[must_use]
    pub fn detect_bottlenecks(&self) -> BottleneckReport {
        let mut found: Vec<(f64, Bottleneck)> = Vec::new();
        for entry in self.windows.iter() {
            let stage = entry.key().clone();
            let Some(summary) = self.summary(&stage) else {
                continue;
            };
            let target = self.targets.get(&stage).copied().unwrap_or(500);
            let limit = target as f64 * self.config.bottleneck_factor;
            if summary.p95 as f64 > limit {
                let ratio = summary.p95 as f64 / target as f64;
                found.push((
                    ratio,
                    Bottleneck {
                        stage: stage.clone(),
                        p95_ms: summary.p95,
                        target_ms: target,
                        recommendations: recommendations_for(&stage),
                    },
                ));
            }
        }
        found.sort_by(|a, b| b.0.total_cmp(&a.0));
        let report = BottleneckReport {
            bottlenecks: found.into_iter().map(|(_, b)| b).collect(),
        };
        if !report.bottlenecks.is_empty() {
            tracing::warn!(
                "bottlenecks detected: {:?}",
                report
                    .bottlenecks
                    .iter()
                    .map(|b| b.stage.as_str())
                    .collect::<Vec<_>>()
            );
            let _ = self.events.send(MonitorEvent::BottlenecksDetected(report.clone()));
        }
        report
    }

    /// Feed resource gauges; alerts when either threshold is crossed.
    pub fn record_resources(&self, cpu_percent: f64, memory_percent: f64) {
        if cpu_percent > self.config.cpu_alert_percent
            || memory_percent > self.config.memory_alert_percent
        {
            tracing::warn!("resource alert: cpu {cpu_percent:.0}% mem {memory_percent:.0}%");
            let _ = self.events.send(MonitorEvent::ResourceAlert {
                cpu_percent,
                memory_percent,
            });
        }
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * quantile).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
