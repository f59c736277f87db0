//! Development stand-ins for the external engines.
//!
//! Real deployments plug gRPC or HTTP clients into the
//! [`vigil_pipeline::clients`] traits. These local implementations keep
//! the service runnable end to end without external dependencies: the
//! recognizer reports no intelligible speech (so unscripted audio flows
//! the silence path), the intent and response engines reuse the core
//! keyword and template logic, and the synthesizer renders a placeholder
//! tone so peers receive audible feedback.

use async_trait::async_trait;
use vigil_core::types::{Intent, ResponseStrategy};
use vigil_pipeline::clients::{
    ClientResult, IntentContext, Recognition, ResponseContext, ResponseGenerator,
    SpeechRecognizer, SpeechSynthesizer, VoiceProfile,
};
use vigil_pipeline::intent::classify_by_keywords;

/// Recognizer stand-in; reports empty transcripts.
pub struct DevRecognizer;

#[async_trait]
impl SpeechRecognizer for DevRecognizer {
    async fn recognize(&self, _samples: &[f32], _sample_rate: u32) -> ClientResult<Recognition> {
        Ok(Recognition {
            text: String::new(),
            confidence: 0.0,
        })
    }
}

/// Intent engine backed by the core keyword table.
pub struct DevIntentClassifier;

#[async_trait]
impl vigil_pipeline::clients::IntentClassifier for DevIntentClassifier {
    async fn classify(&self, text: &str, _context: &IntentContext) -> ClientResult<Intent> {
        Ok(classify_by_keywords(text))
    }
}

/// Response engine phrasing the planner's strategy from templates.
pub struct DevResponder;

#[async_trait]
impl ResponseGenerator for DevResponder {
    async fn generate(&self, _intent: &Intent, context: &ResponseContext) -> ClientResult<String> {
        Ok(match context.strategy {
            ResponseStrategy::PoliteDecline => "不好意思，我们不需要这项服务，谢谢。",
            ResponseStrategy::FirmRejection => "我说过了，不需要，请不要再打来。",
            ResponseStrategy::HumorDeflection => "我考虑一下，大概下辈子吧。",
            ResponseStrategy::InformationGathering => "你们公司叫什么名字？",
            ResponseStrategy::CallTermination => "请不要再打这个电话，再见。",
        }
        .to_string())
    }
}

/// Synthesizer stand-in rendering a short s16le tone per reply.
pub struct DevSynthesizer {
    sample_rate: u32,
}

impl DevSynthesizer {
    /// Synthesizer producing tones at `sample_rate`.
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl SpeechSynthesizer for DevSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> ClientResult<Vec<u8>> {
        // 40 ms of tone per character, pitched by the voice profile.
        let chars = text.chars().count().max(1);
        let samples = self.sample_rate as usize * 40 * chars / 1000;
        let frequency = 440.0 * 2f64.powf(f64::from(voice.pitch) / 12.0);
        let bytes = (0..samples)
            .flat_map(|i| {
                let t = i as f64 / f64::from(self.sample_rate);
                let v = 0.2 * (2.0 * std::f64::consts::PI * frequency * t).sin();
                ((v * 32767.0) as i16).to_le_bytes()
            })
            .collect();
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dev_recognizer_reports_silence() {
        let recognition = DevRecognizer.recognize(&[0.1; 64], 16_000).await.unwrap();
        assert!(recognition.text.is_empty());
    }

    #[tokio::test]
    async fn test_dev_synth_length_scales_with_text() {
        let synth = DevSynthesizer::new(16_000);
        let voice = VoiceProfile::default();
        let short = synth.synthesize("你好", &voice).await.unwrap();
        let long = synth.synthesize("你好你好你好", &voice).await.unwrap();
        assert!(long.len() > short.len());
        assert_eq!(short.len() % 2, 0);
    }
}
