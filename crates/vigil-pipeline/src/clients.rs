//! External stage dependency contracts.
//!
//! Recognition, intent classification, response generation, and speech
//! synthesis are external collaborators behind a
//! `{input -> output, latency, error}` contract. The pipeline only sees
//! these traits; each implementation is wrapped by a circuit breaker and
//! a deadline at the call site.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::types::{Intent, ResponseStrategy};

/// Failure reported by an external dependency.
#[derive(Debug, Clone, Error)]
#[error("{service} failed: {message}")]
pub struct ClientError {
    /// Dependency name.
    pub service: &'static str,
    /// Failure description.
    pub message: String,
}

impl ClientError {
    /// Build a client error.
    #[must_use]
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

/// Result type for dependency calls.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Recognizer output.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    /// Recognized text; empty means no intelligible speech.
    pub text: String,
    /// Recognizer confidence in [0, 1].
    pub confidence: f64,
}

/// Conversation context handed to the intent classifier.
#[derive(Debug, Clone, Default)]
pub struct IntentContext {
    /// Most recent transcripts, oldest first.
    pub recent_transcripts: Vec<String>,
    /// Most recent intents, oldest first.
    pub recent_intents: Vec<Intent>,
    /// Call duration so far in milliseconds.
    pub call_duration_ms: u64,
    /// Speech chunks observed so far.
    pub message_count: u32,
}

/// Assistant personality shaping generated replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityProfile {
    /// Name the assistant answers with.
    pub assistant_name: String,
    /// Phrasing style.
    pub style: PersonalityStyle,
}

/// Phrasing style of the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersonalityStyle {
    /// Courteous and apologetic.
    Polite,
    /// Short and unambiguous.
    Direct,
    /// Light deflection.
    Humorous,
}

impl Default for PersonalityProfile {
    fn default() -> Self {
        Self {
            assistant_name: "Assistant".to_string(),
            style: PersonalityStyle::Polite,
        }
    }
}

/// Context handed to the response generator.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    /// Most recent transcripts, oldest first.
    pub recent_transcripts: Vec<String>,
    /// Speech chunks observed so far.
    pub message_count: u32,
    /// Call duration so far in milliseconds.
    pub call_duration_ms: u64,
    /// Personality shaping the reply.
    pub personality: PersonalityProfile,
    /// Strategy the planner selected; the generator phrases within it.
    pub strategy: ResponseStrategy,
}

/// Per-user synthesis voice parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceProfile {
    /// Engine voice identifier.
    pub voice_id: String,
    /// Speaking rate multiplier.
    pub speaking_rate: f32,
    /// Pitch shift in semitones.
    pub pitch: f32,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            voice_id: "neutral-1".to_string(),
            speaking_rate: 1.0,
            pitch: 0.0,
        }
    }
}

/// Speech-to-text engine.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Recognize canonical f32 mono audio.
    async fn recognize(&self, samples: &[f32], sample_rate: u32) -> ClientResult<Recognition>;
}

/// Intent classification engine.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify a transcript with conversation context.
    async fn classify(&self, text: &str, context: &IntentContext) -> ClientResult<Intent>;
}

/// Reply text generation engine.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generate reply text for an intent within the planner's strategy.
    async fn generate(&self, intent: &Intent, context: &ResponseContext) -> ClientResult<String>;
}

/// Text-to-speech engine.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize reply audio with the user's voice profile.
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> ClientResult<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let err = ClientError::new("recognizer", "connection reset");
        assert_eq!(err.to_string(), "recognizer failed: connection reset");
    }

    #[test]
    fn test_profile_defaults() {
        let personality = PersonalityProfile::default();
        assert_eq!(personality.style, PersonalityStyle::Polite);
        let voice = VoiceProfile::default();
        assert!((voice.speaking_rate - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_profile_serde() {
        let json = serde_json::to_string(&PersonalityProfile::default()).unwrap();
        assert!(json.contains("\"style\":\"polite\""));
        let voice: VoiceProfile =
            serde_json::from_str(r#"{"voiceId":"warm-2","speakingRate":1.2,"pitch":-1.0}"#)
                .unwrap();
        assert_eq!(voice.voice_id, "warm-2");
    }
}
