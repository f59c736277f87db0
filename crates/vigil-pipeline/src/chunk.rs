//! Chunk decoding and validation.
//!
//! Stage 1 turns the declared wire encoding into canonical audio: f32
//! mono samples in [-1, 1]. PCM (s16le) decodes natively; compressed
//! codecs go through the pluggable decoder registry, since codec engines
//! are external collaborators. Encodings with no registered decoder are
//! rejected as validation errors.

use crate::error::{PipelineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use vigil_core::types::{AudioChunk, AudioEncoding};

/// Decodes one wire encoding into canonical f32 mono samples.
pub trait AudioDecoder: Send + Sync {
    /// Decode `payload` into f32 mono samples in [-1, 1].
    ///
    /// # Errors
    /// Returns a decode failure description.
    fn decode(
        &self,
        payload: &[u8],
        sample_rate: u32,
        channels: u8,
    ) -> std::result::Result<Vec<f32>, String>;
}

/// Built-in decoder for raw s16le PCM.
struct PcmDecoder;

impl AudioDecoder for PcmDecoder {
    fn decode(
        &self,
        payload: &[u8],
        _sample_rate: u32,
        channels: u8,
    ) -> std::result::Result<Vec<f32>, String> {
        if payload.len() % 2 != 0 {
            return Err("odd PCM byte length".to_string());
        }
        let samples: Vec<f32> = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        Ok(downmix(samples, channels))
    }
}

/// Interleaved multi-channel samples averaged down to mono.
fn downmix(samples: Vec<f32>, channels: u8) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples;
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Registry of decoders keyed by wire encoding.
pub struct DecoderRegistry {
    decoders: DashMap<AudioEncoding, Arc<dyn AudioDecoder>>,
}

impl DecoderRegistry {
    /// Registry with the built-in PCM decoder only.
    #[must_use]
    pub fn new() -> Self {
        let decoders: DashMap<AudioEncoding, Arc<dyn AudioDecoder>> = DashMap::new();
        decoders.insert(AudioEncoding::Pcm, Arc::new(PcmDecoder));
        Self { decoders }
    }

    /// Register a decoder for an encoding, replacing any existing one.
    pub fn register(&self, encoding: AudioEncoding, decoder: Arc<dyn AudioDecoder>) {
        self.decoders.insert(encoding, decoder);
    }

    /// Whether `encoding` has a registered decoder.
    #[must_use]
    pub fn supports(&self, encoding: AudioEncoding) -> bool {
        self.decoders.contains_key(&encoding)
    }

    /// Validate and decode a chunk into canonical samples.
    ///
    /// Validation: non-empty payload, payload no larger than
    /// `max_payload` (ten times the nominal chunk size), a registered
    /// decoder for the declared encoding.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidChunk`] or
    /// [`PipelineError::UnsupportedEncoding`].
    pub fn decode_chunk(&self, chunk: &AudioChunk, max_payload: usize) -> Result<Vec<f32>> {
        if chunk.payload.is_empty() {
            return Err(PipelineError::InvalidChunk("empty payload".to_string()));
        }
        if chunk.payload.len() > max_payload {
            return Err(PipelineError::InvalidChunk(format!(
                "payload {} exceeds limit {max_payload}",
                chunk.payload.len()
            )));
        }
        if chunk.sample_rate == 0 {
            return Err(PipelineError::InvalidChunk("zero sample rate".to_string()));
        }
        let decoder = self
            .decoders
            .get(&chunk.encoding)
            .ok_or(PipelineError::UnsupportedEncoding(chunk.encoding.as_str()))?;
        let samples = decoder
            .decode(&chunk.payload, chunk.sample_rate, chunk.channel_count)
            .map_err(PipelineError::InvalidChunk)?;
        if samples.is_empty() {
            return Err(PipelineError::InvalidChunk("decoded to no samples".to_string()));
        }
        Ok(samples)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_chunk(payload: Vec<u8>, channels: u8) -> AudioChunk {
        AudioChunk {
            id: "chunk-1".into(),
            call_id: "call-1".into(),
            timestamp: 0,
            sequence_number: 1,
            payload,
            sample_rate: 16_000,
            channel_count: channels,
            encoding: AudioEncoding::Pcm,
        }
    }

    #[test]
    fn test_pcm_decode_scaling() {
        let registry = DecoderRegistry::new();
        // Samples: 0, max positive, min negative.
        let payload = [0i16, i16::MAX, i16::MIN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = registry.decode_chunk(&pcm_chunk(payload, 1), 1 << 20).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - (32767.0 / 32768.0)).abs() < 1e-6);
        assert_eq!(samples[2], -1.0);
    }

    #[test]
    fn test_stereo_downmix() {
        let registry = DecoderRegistry::new();
        // L=0.5-ish, R=-0.5-ish alternating: downmix averages to ~0.
        let payload = [16384i16, -16384, 16384, -16384]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = registry.decode_chunk(&pcm_chunk(payload, 2), 1 << 20).unwrap();
        assert_eq!(samples.len(), 2);
        for s in samples {
            assert!(s.abs() < 1e-6);
        }
    }

    #[test]
    fn test_empty_payload_rejected() {
        let registry = DecoderRegistry::new();
        let err = registry.decode_chunk(&pcm_chunk(vec![], 1), 1 << 20).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunk(_)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let registry = DecoderRegistry::new();
        let err = registry
            .decode_chunk(&pcm_chunk(vec![0; 100], 1), 50)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunk(_)));
    }

    #[test]
    fn test_odd_length_pcm_rejected() {
        let registry = DecoderRegistry::new();
        let err = registry
            .decode_chunk(&pcm_chunk(vec![0; 3], 1), 1 << 20)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidChunk(_)));
    }

    #[test]
    fn test_unregistered_encoding_rejected() {
        let registry = DecoderRegistry::new();
        let mut chunk = pcm_chunk(vec![0; 4], 1);
        chunk.encoding = AudioEncoding::Opus;
        let err = registry.decode_chunk(&chunk, 1 << 20).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedEncoding("opus")));
    }

    #[test]
    fn test_custom_decoder_registration() {
        struct Upsampler;
        impl AudioDecoder for Upsampler {
            fn decode(&self, payload: &[u8], _: u32, _: u8) -> std::result::Result<Vec<f32>, String> {
                Ok(payload.iter().map(|b| *b as f32 / 255.0).collect())
            }
        }
        let registry = DecoderRegistry::new();
        registry.register(AudioEncoding::Opus, Arc::new(Upsampler));
        assert!(registry.supports(AudioEncoding::Opus));

        let mut chunk = pcm_chunk(vec![255, 0], 1);
        chunk.encoding = AudioEncoding::Opus;
        let samples = registry.decode_chunk(&chunk, 1 << 20).unwrap();
        assert_eq!(samples, vec![1.0, 0.0]);
    }
}
