//! Adaptive per-call DSP chain.
//!
//! Stage 1 runs each canonical chunk through noise reduction, echo
//! suppression, and automatic gain control, all per-call and
//! live-tunable. [`AdaptiveAudioProcessor::optimize_for_call`] nudges the
//! parameters from observed latency and quality: a call running hot gets
//! a lighter chain, a call sounding poor gets a heavier one. Parameter
//! changes apply from the next chunk; the chunk being processed reads a
//! snapshot taken at entry.

use dashmap::DashMap;
use std::sync::Mutex;
use vigil_core::types::{CallId, QualityMetrics};

/// Echo tail floor in milliseconds.
pub const TAIL_FLOOR_MS: u32 = 32;
/// Echo tail ceiling in milliseconds.
pub const TAIL_CEILING_MS: u32 = 256;
/// Echo tail adjustment step in milliseconds.
pub const TAIL_STEP_MS: u32 = 32;
/// Maximum noise reduction aggressiveness.
pub const MAX_AGGRESSIVENESS: u8 = 3;

/// Live-tunable DSP parameters for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct DspParams {
    /// Noise reduction stage enabled.
    pub noise_reduction: bool,
    /// Noise reduction aggressiveness, 0 (off) to 3.
    pub aggressiveness: u8,
    /// Echo suppression stage enabled.
    pub echo_cancellation: bool,
    /// Echo tail length in milliseconds.
    pub echo_tail_ms: u32,
    /// Echo suppression factor in [0, 1].
    pub echo_suppression: f64,
    /// Automatic gain control enabled.
    pub agc: bool,
    /// AGC target RMS level.
    pub agc_target: f64,
    /// Maximum AGC gain.
    pub agc_max_gain: f64,
}

impl Default for DspParams {
    fn default() -> Self {
        Self {
            noise_reduction: true,
            aggressiveness: 1,
            echo_cancellation: true,
            echo_tail_ms: 128,
            echo_suppression: 0.5,
            agc: true,
            agc_target: 0.1,
            agc_max_gain: 8.0,
        }
    }
}

/// Per-call DSP state: parameters plus the echo delay line.
struct CallDsp {
    params: DspParams,
    /// Tail of the previous chunk feeding the echo estimator.
    delay_line: Vec<f32>,
    /// Smoothed AGC gain carried between chunks.
    agc_gain: f64,
}

/// Adaptive audio processor shared by every call worker.
pub struct AdaptiveAudioProcessor {
    calls: DashMap<CallId, Mutex<CallDsp>>,
}

impl AdaptiveAudioProcessor {
    /// Create an empty processor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Snapshot a call's parameters, creating defaults on first use.
    #[must_use]
    pub fn params(&self, call_id: &str) -> DspParams {
        self.entry(call_id, |state| state.params.clone())
    }

    /// Replace a call's parameters; effective from the next chunk.
    pub fn set_params(&self, call_id: &str, params: DspParams) {
        self.entry(call_id, |state| state.params = params);
    }

    /// Drop a finished call's state.
    pub fn remove_call(&self, call_id: &str) {
        self.calls.remove(call_id);
    }

    fn entry<T>(&self, call_id: &str, f: impl FnOnce(&mut CallDsp) -> T) -> T {
        let entry = self.calls.entry(call_id.to_string()).or_insert_with(|| {
            Mutex::new(CallDsp {
                params: DspParams::default(),
                delay_line: Vec::new(),
                agc_gain: 1.0,
            })
        });
        let mut state = entry.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state)
    }

    /// Run the chain over one canonical chunk in place, returning the
    /// chunk's quality metrics.
    pub fn process(
        &self,
        call_id: &str,
        samples: &mut [f32],
        sample_rate: u32,
    ) -> QualityMetrics {
        self.entry(call_id, |state| {
            let params = state.params.clone();
            let raw_level = rms(samples);

            let noise_level = if params.noise_reduction && params.aggressiveness > 0 {
                noise_gate(samples, params.aggressiveness)
            } else {
                0.0
            };

            if params.echo_cancellation {
                echo_suppress(
                    samples,
                    &mut state.delay_line,
                    params.echo_tail_ms,
                    params.echo_suppression,
                    sample_rate,
                );
            }

            if params.agc {
                state.agc_gain = agc(
                    samples,
                    state.agc_gain,
                    params.agc_target,
                    params.agc_max_gain,
                );
            }

            let signal_level = rms(samples);
            let quality_score = if raw_level <= 0.0 {
                0.0
            } else {
                (signal_level / (signal_level + noise_level + 1e-9)).clamp(0.0, 1.0)
            };
            QualityMetrics {
                quality_score,
                signal_level,
                noise_level,
            }
        })
    }

    /// Tune a call's parameters from its observed latency and quality.
    ///
    /// Over-latency lightens the chain (aggressiveness down, shorter echo
    /// tail); under-quality deepens it (aggressiveness up, longer tail).
    /// Both adjustments clamp at their floors and ceilings.
    pub fn optimize_for_call(
        &self,
        call_id: &str,
        rolling_latency_ms: f64,
        latency_target_ms: f64,
        rolling_quality: f64,
        quality_threshold: f64,
    ) {
        self.entry(call_id, |state| {
            let params = &mut state.params;
            if rolling_latency_ms > latency_target_ms {
                params.aggressiveness = params.aggressiveness.saturating_sub(1);
                params.echo_tail_ms =
                    params.echo_tail_ms.saturating_sub(TAIL_STEP_MS).max(TAIL_FLOOR_MS);
                tracing::debug!(
                    "dsp lightened for {call_id}: aggr {} tail {}ms",
                    params.aggressiveness,
                    params.echo_tail_ms
                );
            }
            if rolling_quality < quality_threshold {
                params.aggressiveness = (params.aggressiveness + 1).min(MAX_AGGRESSIVENESS);
                params.echo_tail_ms = (params.echo_tail_ms + TAIL_STEP_MS).min(TAIL_CEILING_MS);
                tracing::debug!(
                    "dsp deepened for {call_id}: aggr {} tail {}ms",
                    params.aggressiveness,
                    params.echo_tail_ms
                );
            }
        });
    }
}

impl Default for AdaptiveAudioProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Attenuate samples under the gate threshold; returns the estimated
/// noise floor that was suppressed.
fn noise_gate(samples: &mut [f32], aggressiveness: u8) -> f64 {
    let gate = f64::from(aggressiveness) * 0.004;
    let attenuation = 0.5f32.powi(i32::from(aggressiveness));
    let mut suppressed = 0.0f64;
    let mut count = 0usize;
    for sample in samples.iter_mut() {
        if f64::from(sample.abs()) < gate {
            suppressed += f64::from(sample.abs());
            count += 1;
            *sample *= attenuation;
        }
    }
    if count == 0 {
        0.0
    } else {
        suppressed / count as f64
    }
}

/// Subtract a correlated, delayed copy of the signal.
fn echo_suppress(
    samples: &mut [f32],
    delay_line: &mut Vec<f32>,
    tail_ms: u32,
    suppression: f64,
    sample_rate: u32,
) {
    let tail_len = (u64::from(sample_rate) * u64::from(tail_ms) / 1000) as usize;
    if tail_len == 0 {
        return;
    }

    // Correlation between the chunk head and the delay line tail decides
    // how much delayed signal to subtract.
    let overlap = delay_line.len().min(samples.len()).min(tail_len);
    if overlap > 0 {
        let tail = &delay_line[delay_line.len() - overlap..];
        let mut num = 0.0f64;
        let mut den = 0.0f64;
        for (s, d) in samples[..overlap].iter().zip(tail.iter()) {
            num += f64::from(*s) * f64::from(*d);
            den += f64::from(*d) * f64::from(*d);
        }
        if den > 1e-9 {
            let coeff = (num / den).clamp(-1.0, 1.0) * suppression;
            for (s, d) in samples[..overlap].iter_mut().zip(tail.iter()) {
                *s -= (coeff * f64::from(*d)) as f32;
            }
        }
    }

    // Keep the newest tail for the next chunk.
    delay_line.extend_from_slice(samples);
    let keep = delay_line.len().saturating_sub(tail_len);
    delay_line.drain(..keep);
}

/// Normalize toward the target RMS; returns the smoothed gain to carry.
fn agc(samples: &mut [f32], previous_gain: f64, target: f64, max_gain: f64) -> f64 {
    let level = rms(samples);
    if level <= 1e-6 {
        return previous_gain;
    }
    let desired = (target / level).clamp(1.0 / max_gain, max_gain);
    // Smooth toward the desired gain to avoid pumping between chunks.
    let gain = previous_gain * 0.7 + desired * 0.3;
    for sample in samples.iter_mut() {
        *sample = (f64::from(*sample) * gain).clamp(-1.0, 1.0) as f32;
    }
    gain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * ((i as f32) * 0.2).sin())
            .collect()
    }

    #[test]
    fn test_default_params() {
        let processor = AdaptiveAudioProcessor::new();
        let params = processor.params("call-1");
        assert_eq!(params.aggressiveness, 1);
        assert_eq!(params.echo_tail_ms, 128);
        assert!(params.agc);
    }

    #[test]
    fn test_agc_boosts_quiet_signal() {
        let processor = AdaptiveAudioProcessor::new();
        let mut params = processor.params("call-1");
        params.noise_reduction = false;
        params.echo_cancellation = false;
        processor.set_params("call-1", params);

        let mut samples = tone(0.01, 2048);
        let before = rms(&samples);
        // Several chunks let the smoothed gain converge.
        for _ in 0..10 {
            processor.process("call-1", &mut samples, 16_000);
        }
        let after = rms(&samples);
        assert!(after > before * 2.0, "agc failed: {before} -> {after}");
    }

    #[test]
    fn test_noise_gate_attenuates_floor() {
        let processor = AdaptiveAudioProcessor::new();
        let mut params = processor.params("call-1");
        params.aggressiveness = 3;
        params.echo_cancellation = false;
        params.agc = false;
        processor.set_params("call-1", params);

        // All samples under the gate threshold.
        let mut samples = vec![0.005f32; 1024];
        let metrics = processor.process("call-1", &mut samples, 16_000);
        assert!(samples.iter().all(|s| *s < 0.005));
        assert!(metrics.noise_level > 0.0);
    }

    #[test]
    fn test_optimize_lightens_on_latency() {
        let processor = AdaptiveAudioProcessor::new();
        processor.optimize_for_call("call-1", 900.0, 700.0, 0.9, 0.5);
        let params = processor.params("call-1");
        assert_eq!(params.aggressiveness, 0);
        assert_eq!(params.echo_tail_ms, 96);

        // Clamped at the floors.
        for _ in 0..10 {
            processor.optimize_for_call("call-1", 900.0, 700.0, 0.9, 0.5);
        }
        let params = processor.params("call-1");
        assert_eq!(params.aggressiveness, 0);
        assert_eq!(params.echo_tail_ms, TAIL_FLOOR_MS);
    }

    #[test]
    fn test_optimize_deepens_on_quality() {
        let processor = AdaptiveAudioProcessor::new();
        processor.optimize_for_call("call-1", 100.0, 700.0, 0.2, 0.5);
        let params = processor.params("call-1");
        assert_eq!(params.aggressiveness, 2);
        assert_eq!(params.echo_tail_ms, 160);

        // Clamped at the ceilings.
        for _ in 0..10 {
            processor.optimize_for_call("call-1", 100.0, 700.0, 0.2, 0.5);
        }
        let params = processor.params("call-1");
        assert_eq!(params.aggressiveness, MAX_AGGRESSIVENESS);
        assert_eq!(params.echo_tail_ms, TAIL_CEILING_MS);
    }

    #[test]
    fn test_quality_metrics_shape() {
        let processor = AdaptiveAudioProcessor::new();
        let mut samples = tone(0.3, 2048);
        let metrics = processor.process("call-1", &mut samples, 16_000);
        assert!(metrics.signal_level > 0.0);
        assert!((0.0..=1.0).contains(&metrics.quality_score));
    }

    #[test]
    fn test_remove_call_resets_state() {
        let processor = AdaptiveAudioProcessor::new();
        processor.optimize_for_call("call-1", 900.0, 700.0, 0.9, 0.5);
        processor.remove_call("call-1");
        // Fresh defaults after removal.
        assert_eq!(processor.params("call-1").aggressiveness, 1);
    }
}
