//! Shared domain types for the VIGIL voice core.
//!
//! These types flow between every subsystem: audio chunks enter through the
//! transport layer, move through the per-call pipeline, and leave as
//! pipeline results. The closed enums here mirror the wire protocol's
//! closed sets; adding a variant is a protocol change.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a telephony call. Multiple sessions may observe one call,
/// but only one pipeline worker processes audio for it at any time.
pub type CallId = String;

/// Identifier of an application-level session.
pub type SessionId = String;

/// Identifier of a transport-level connection owned by the pool.
pub type ConnectionId = String;

/// Identifier of a signaling peer.
pub type PeerId = String;

/// Identifier of an authenticated user.
pub type UserId = String;

/// Milliseconds since the Unix epoch.
///
/// Saturates to zero if the system clock is before the epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Audio encodings accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// Raw signed 16-bit little-endian PCM.
    Pcm,
    /// Opus-encoded audio.
    Opus,
    /// AAC-encoded audio.
    Aac,
    /// MP3-encoded audio.
    Mp3,
}

impl AudioEncoding {
    /// Wire name of the encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Opus => "opus",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
        }
    }
}

/// A contiguous fragment of call audio.
///
/// Within a call, `sequence_number` is strictly increasing as produced and
/// consumers must process chunks in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    /// Unique chunk identifier.
    pub id: String,
    /// Call this chunk belongs to.
    pub call_id: CallId,
    /// Capture timestamp (ms since epoch).
    pub timestamp: u64,
    /// Strictly increasing position within the call.
    pub sequence_number: u64,
    /// Encoded audio bytes.
    #[serde(with = "crate::envelope::base64_bytes")]
    pub payload: Vec<u8>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count (1 = mono).
    pub channel_count: u8,
    /// Declared payload encoding.
    pub encoding: AudioEncoding,
}

/// Quality metrics attached to sessions and pipeline results.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    /// SNR-like quality proxy in [0, 1].
    pub quality_score: f64,
    /// Observed signal level in [0, 1].
    pub signal_level: f64,
    /// Estimated noise floor in [0, 1].
    pub noise_level: f64,
}

/// Category of caller intent recognized by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntentCategory {
    /// Generic sales call.
    SalesCall,
    /// Loan or credit offer.
    LoanOffer,
    /// Investment pitch.
    InvestmentPitch,
    /// Insurance sales.
    InsuranceSales,
    /// Survey or poll.
    Survey,
    /// Telemarketing campaign.
    Telemarketing,
    /// Could not be categorized.
    Unknown,
}

/// Emotional tone detected in the caller's speech.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EmotionalTone {
    /// No marked tone.
    Neutral,
    /// Friendly or warm.
    Friendly,
    /// Aggressive or hostile.
    Aggressive,
    /// Persuasive, pressuring.
    Persuasive,
    /// Urgent, rushing.
    Urgent,
    /// Confused or lost.
    Confused,
}

/// Structured intent produced by stage 4 of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    /// Free-form intent label.
    pub label: String,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
    /// Closed intent category.
    pub category: IntentCategory,
    /// Detected emotional tone.
    pub emotional_tone: EmotionalTone,
    /// Extracted entities (name -> value).
    #[serde(default)]
    pub entities: std::collections::BTreeMap<String, String>,
}

impl Intent {
    /// A low-confidence unknown intent, used by fallback paths.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            label: "unknown".to_string(),
            confidence: 0.1,
            category: IntentCategory::Unknown,
            emotional_tone: EmotionalTone::Neutral,
            entities: std::collections::BTreeMap::new(),
        }
    }
}

/// Strategy the response generator chose for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStrategy {
    /// Courteous refusal; the opening posture.
    PoliteDecline,
    /// Firm refusal after repeated persistence.
    FirmRejection,
    /// Deflect with humor.
    HumorDeflection,
    /// Draw the caller out to gather evidence.
    InformationGathering,
    /// End the call.
    CallTermination,
}

/// Reply produced by stage 5 of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Reply text, post-processed to at most 50 characters.
    pub text: String,
    /// Whether the peer should tear the call down. Advisory only.
    pub should_terminate: bool,
    /// Generator confidence in [0, 1].
    pub confidence: f64,
    /// Strategy used to produce the reply.
    pub strategy: ResponseStrategy,
    /// Synthesized reply audio, when stage 6 succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "crate::envelope::opt_base64_bytes")]
    pub response_audio: Option<Vec<u8>>,
}

/// Outcome of running one audio chunk through the pipeline.
///
/// A result with only `processing_latency_ms` populated is the canonical
/// "silence / no speech" outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Chunk this result belongs to.
    pub chunk_id: String,
    /// Call the chunk belongs to.
    pub call_id: CallId,
    /// Emission timestamp (ms since epoch).
    pub timestamp: u64,
    /// End-to-end pipeline latency for this chunk.
    pub processing_latency_ms: u64,
    /// Recognized transcript, absent on silence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    /// Classified intent, absent on silence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    /// Generated response, absent on silence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    /// Chunk quality metrics.
    #[serde(default)]
    pub quality_metrics: QualityMetrics,
}

impl PipelineResult {
    /// Build the canonical silence outcome for a chunk.
    #[must_use]
    pub fn silence(chunk_id: &str, call_id: &str, latency_ms: u64) -> Self {
        Self {
            chunk_id: chunk_id.to_string(),
            call_id: call_id.to_string(),
            timestamp: now_ms(),
            processing_latency_ms: latency_ms,
            ..Self::default()
        }
    }

    /// True when this result carries no speech artifacts.
    #[must_use]
    pub fn is_silence(&self) -> bool {
        self.transcript.is_none() && self.intent.is_none() && self.response.is_none()
    }
}

/// Transport-level close codes used in `connection_status` messages.
pub mod status_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation.
    pub const POLICY: u16 = 1008;
    /// Internal error.
    pub const INTERNAL_ERROR: u16 = 1011;
}
