//! Ordered quality tiers.
//!
//! Tiers form a totally ordered list from `ultra` down to `low`; per-call
//! adaptation moves one step at a time, bounded by the endpoints. The
//! tier's bitrate selects the outbound codec.

use serde::Serialize;
use vigil_core::types::AudioEncoding;

/// A named quality preset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTier {
    /// Tier name (`ultra`, `high`, `medium`, `low`).
    pub name: &'static str,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
    /// Per-chunk latency target at this tier.
    pub latency_target_ms: u64,
    /// DSP features enabled at this tier.
    pub enabled_features: &'static [&'static str],
}

impl QualityTier {
    /// Codec selected for this tier's bitrate.
    #[must_use]
    pub fn codec(&self) -> AudioEncoding {
        codec_for_bitrate(self.bitrate_kbps)
    }
}

/// Select a codec by bitrate: >= 32 kbps opus, >= 16 aac, else mp3.
#[must_use]
pub fn codec_for_bitrate(bitrate_kbps: u32) -> AudioEncoding {
    if bitrate_kbps >= 32 {
        AudioEncoding::Opus
    } else if bitrate_kbps >= 16 {
        AudioEncoding::Aac
    } else {
        AudioEncoding::Mp3
    }
}

/// The ordered tier list, best first.
#[must_use]
pub fn default_tiers() -> Vec<QualityTier> {
    vec![
        QualityTier {
            name: "ultra",
            sample_rate: 48_000,
            bitrate_kbps: 64,
            latency_target_ms: 400,
            enabled_features: &["noise_reduction", "echo_cancellation", "agc", "vad"],
        },
        QualityTier {
            name: "high",
            sample_rate: 24_000,
            bitrate_kbps: 32,
            latency_target_ms: 700,
            enabled_features: &["noise_reduction", "echo_cancellation", "vad"],
        },
        QualityTier {
            name: "medium",
            sample_rate: 16_000,
            bitrate_kbps: 16,
            latency_target_ms: 1_000,
            enabled_features: &["noise_reduction", "vad"],
        },
        QualityTier {
            name: "low",
            sample_rate: 8_000,
            bitrate_kbps: 8,
            latency_target_ms: 1_500,
            enabled_features: &["vad"],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_are_ordered() {
        let tiers = default_tiers();
        assert_eq!(tiers.len(), 4);
        assert_eq!(tiers[0].name, "ultra");
        assert_eq!(tiers[3].name, "low");
        for pair in tiers.windows(2) {
            assert!(pair[0].bitrate_kbps > pair[1].bitrate_kbps);
            assert!(pair[0].latency_target_ms < pair[1].latency_target_ms);
        }
    }

    #[test]
    fn test_codec_selection() {
        assert_eq!(codec_for_bitrate(64), AudioEncoding::Opus);
        assert_eq!(codec_for_bitrate(32), AudioEncoding::Opus);
        assert_eq!(codec_for_bitrate(31), AudioEncoding::Aac);
        assert_eq!(codec_for_bitrate(16), AudioEncoding::Aac);
        assert_eq!(codec_for_bitrate(15), AudioEncoding::Mp3);
        assert_eq!(codec_for_bitrate(0), AudioEncoding::Mp3);
    }

    #[test]
    fn test_tier_codecs() {
        let tiers = default_tiers();
        assert_eq!(tiers[0].codec(), AudioEncoding::Opus);
        assert_eq!(tiers[2].codec(), AudioEncoding::Aac);
        assert_eq!(tiers[3].codec(), AudioEncoding::Mp3);
    }
}
