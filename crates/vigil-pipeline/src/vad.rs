//! Voice activity detection.
//!
//! The speech gate decides whether a canonical chunk carries speech
//! before any external dependency is called. Features per chunk: signal
//! energy, zero-crossing rate, a coarse Goertzel filterbank from which
//! spectral centroid, rolloff, and log band energies (an MFCC-family
//! proxy) are derived.
//!
//! The energy threshold adapts: a background noise estimate moves by
//! exponential smoothing whenever observed energy stays below twice the
//! estimate, and the effective threshold is
//! `max(3 * background, base_threshold)`. A hangover window keeps the
//! gate open for a few chunks after speech ends so trailing syllables are
//! not clipped.

/// Filterbank center frequencies in Hz.
const BANDS: [f64; 8] = [250.0, 500.0, 750.0, 1000.0, 1500.0, 2000.0, 3000.0, 4000.0];

/// EMA coefficient for the background noise estimate.
const NOISE_ALPHA: f64 = 0.05;

/// Fraction of spectral energy defining the rolloff point.
const ROLLOFF_FRACTION: f64 = 0.85;

/// Per-chunk feature snapshot and decision.
#[derive(Debug, Clone, PartialEq)]
pub struct VadDecision {
    /// Final gate decision, hangover included.
    pub is_speech: bool,
    /// Mean signal energy (mean square) of the chunk.
    pub energy: f64,
    /// Zero-crossing rate in [0, 1].
    pub zero_crossing_rate: f64,
    /// Spectral centroid in Hz.
    pub spectral_centroid: f64,
    /// Spectral rolloff frequency in Hz.
    pub spectral_rolloff: f64,
    /// Log energies of the filterbank bands.
    pub band_log_energies: [f64; 8],
    /// Effective energy threshold used for the decision.
    pub threshold: f64,
}

/// Adaptive per-call speech gate.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    base_threshold: f64,
    hangover_chunks: u32,
    background_level: f64,
    hangover_remaining: u32,
}

impl VoiceActivityDetector {
    /// Create a detector with the given base energy threshold and
    /// hangover length in chunks.
    #[must_use]
    pub fn new(base_threshold: f64, hangover_chunks: u32) -> Self {
        Self {
            base_threshold,
            hangover_chunks,
            // Start below the base so the effective threshold begins at
            // the configured floor.
            background_level: base_threshold / 3.0,
            hangover_remaining: 0,
        }
    }

    /// Current background noise estimate.
    #[must_use]
    pub fn background_level(&self) -> f64 {
        self.background_level
    }

    /// Effective energy threshold right now.
    #[must_use]
    pub fn effective_threshold(&self) -> f64 {
        (self.background_level * 3.0).max(self.base_threshold)
    }

    /// Gate one canonical chunk.
    pub fn detect(&mut self, samples: &[f32], sample_rate: u32) -> VadDecision {
        let energy = mean_square(samples);
        let zero_crossing_rate = zero_crossings(samples);
        let band_energies = filterbank(samples, sample_rate);
        let spectral_centroid = centroid(&band_energies);
        let spectral_rolloff = rolloff(&band_energies);
        let band_log_energies = band_energies.map(|e| (e + 1e-12).ln());

        // Track background noise on quiet chunks only.
        if energy < 2.0 * self.background_level {
            self.background_level =
                self.background_level * (1.0 - NOISE_ALPHA) + energy * NOISE_ALPHA;
        }
        let threshold = self.effective_threshold();

        let energetic = energy > threshold;
        let voiced = (0.005..0.45).contains(&zero_crossing_rate);
        let in_speech_band = (80.0..4000.0).contains(&spectral_centroid);
        let raw_speech = energetic && voiced && in_speech_band;

        let is_speech = if raw_speech {
            self.hangover_remaining = self.hangover_chunks;
            true
        } else if self.hangover_remaining > 0 {
            self.hangover_remaining -= 1;
            true
        } else {
            false
        };

        VadDecision {
            is_speech,
            energy,
            zero_crossing_rate,
            spectral_centroid,
            spectral_rolloff,
            band_log_energies,
            threshold,
        }
    }
}

fn mean_square(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples
        .iter()
        .map(|s| f64::from(*s) * f64::from(*s))
        .sum::<f64>()
        / samples.len() as f64
}

fn zero_crossings(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f64 / (samples.len() - 1) as f64
}

/// Goertzel energy at each band center.
fn filterbank(samples: &[f32], sample_rate: u32) -> [f64; 8] {
    let mut energies = [0.0f64; 8];
    if samples.is_empty() || sample_rate == 0 {
        return energies;
    }
    let nyquist = f64::from(sample_rate) / 2.0;
    for (band, energy) in BANDS.iter().zip(energies.iter_mut()) {
        if *band >= nyquist {
            continue;
        }
        *energy = goertzel(samples, *band, sample_rate);
    }
    energies
}

/// Single-bin Goertzel magnitude-squared, normalized by length.
fn goertzel(samples: &[f32], frequency: f64, sample_rate: u32) -> f64 {
    let omega = 2.0 * std::f64::consts::PI * frequency / f64::from(sample_rate);
    let coeff = 2.0 * omega.cos();
    let mut s_prev = 0.0f64;
    let mut s_prev2 = 0.0f64;
    for sample in samples {
        let s = f64::from(*sample) + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }
    let power = s_prev * s_prev + s_prev2 * s_prev2 - coeff * s_prev * s_prev2;
    power / (samples.len() as f64 * samples.len() as f64)
}

fn centroid(energies: &[f64; 8]) -> f64 {
    let total: f64 = energies.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    BANDS
        .iter()
        .zip(energies.iter())
        .map(|(f, e)| f * e)
        .sum::<f64>()
        / total
}

fn rolloff(energies: &[f64; 8]) -> f64 {
    let total: f64 = energies.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mut cumulative = 0.0;
    for (f, e) in BANDS.iter().zip(energies.iter()) {
        cumulative += e;
        if cumulative >= ROLLOFF_FRACTION * total {
            return *f;
        }
    }
    BANDS[BANDS.len() - 1]
}
