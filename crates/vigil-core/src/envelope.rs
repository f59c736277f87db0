//! Versioned message envelope for every service boundary.
//!
//! Each frame on the wire is a UTF-8 JSON object carrying a typed payload
//! from a closed message-type set, an integrity checksum, optional
//! per-connection sequencing, and delivery metadata. The payload is a
//! tagged union: parsing returns a typed variant or a validation error,
//! never a bag of dynamic fields.
//!
//! # Frame layout
//!
//! ```text
//! { "version":"2.0", "type":"audio_chunk", "id":"<uuid>", "timestamp":<ms>,
//!   "sequenceNumber":7, "ackRequired":true, "checksum":"9f2ab310",
//!   "payload":{ ... }, "metadata":{ "source":"gateway", "priority":"high" } }
//! ```
//!
//! Payloads larger than the configured threshold are zstd-compressed and
//! carried as a base64 string with `compressed: true`. The checksum is
//! always computed over the uncompressed canonical payload.

use crate::checksum::envelope_checksum;
use crate::error::{CoreError, Result};
use crate::types::{AudioChunk, AudioEncoding, CallId, SessionId, UserId, now_ms};
use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default payload size above which compression kicks in.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 8 * 1024;

/// Zstd level used for payload compression.
const COMPRESSION_LEVEL: i32 = 3;

/// Delivery priority carried in envelope metadata.
///
/// Priorities at or above [`Priority::High`] are implicitly `ackRequired`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Latency-sensitive traffic; acked.
    High,
    /// Control-plane traffic; acked.
    Urgent,
}

/// The closed set of message types consumed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Inbound caller audio.
    AudioChunk,
    /// Synthesized reply audio.
    AudioResponse,
    /// Recognized caller speech.
    Transcript,
    /// Generated assistant reply.
    AiResponse,
    /// Liveness probe.
    Heartbeat,
    /// Transport-level status change.
    ConnectionStatus,
    /// Pipeline progress notification.
    ProcessingStatus,
    /// Component metric readings.
    Metrics,
    /// Structured failure notification.
    Error,
    /// Media negotiation offer.
    WebrtcOffer,
    /// Media negotiation answer.
    WebrtcAnswer,
    /// Media candidate exchange.
    WebrtcIceCandidate,
    /// Reattach a dropped connection to its session.
    SessionRecovery,
    /// Delivery acknowledgement.
    Ack,
}

impl MessageType {
    /// Wire name of this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AudioChunk => "audio_chunk",
            Self::AudioResponse => "audio_response",
            Self::Transcript => "transcript",
            Self::AiResponse => "ai_response",
            Self::Heartbeat => "heartbeat",
            Self::ConnectionStatus => "connection_status",
            Self::ProcessingStatus => "processing_status",
            Self::Metrics => "metrics",
            Self::Error => "error",
            Self::WebrtcOffer => "webrtc_offer",
            Self::WebrtcAnswer => "webrtc_answer",
            Self::WebrtcIceCandidate => "webrtc_ice_candidate",
            Self::SessionRecovery => "session_recovery",
            Self::Ack => "ack",
        }
    }

    /// Parse a wire name into a message type.
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| CoreError::Invalid(format!("unknown message type: {s}")))
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of an inbound audio chunk payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkPayload {
    /// Chunk identifier.
    pub id: String,
    /// Owning call.
    pub call_id: CallId,
    /// Position within the call.
    pub sequence_number: u64,
    /// Capture timestamp (ms since epoch).
    pub timestamp: u64,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u8,
    /// Declared encoding.
    pub encoding: AudioEncoding,
    /// Base64 audio bytes.
    #[serde(with = "base64_bytes")]
    pub audio_data: Vec<u8>,
}

impl AudioChunkPayload {
    /// Convert the wire payload into the domain chunk type.
    #[must_use]
    pub fn into_chunk(self) -> AudioChunk {
        AudioChunk {
            id: self.id,
            call_id: self.call_id,
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
            payload: self.audio_data,
            sample_rate: self.sample_rate,
            channel_count: self.channels,
            encoding: self.encoding,
        }
    }
}

/// Synthesized reply audio returned to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioResponsePayload {
    /// Owning call.
    pub call_id: CallId,
    /// Chunk that produced this reply.
    pub chunk_id: String,
    /// Encoding of the reply audio.
    pub encoding: AudioEncoding,
    /// Sample rate of the reply audio.
    pub sample_rate: u32,
    /// Base64 audio bytes.
    #[serde(with = "base64_bytes")]
    pub audio_data: Vec<u8>,
}

/// Recognized speech for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptPayload {
    /// Owning call.
    pub call_id: CallId,
    /// Chunk the transcript belongs to.
    pub chunk_id: String,
    /// Recognized text.
    pub text: String,
    /// Recognizer confidence in [0, 1].
    pub confidence: f64,
}

/// Generated assistant reply for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResponsePayload {
    /// Owning call.
    pub call_id: CallId,
    /// Chunk the reply belongs to.
    pub chunk_id: String,
    /// Reply text (at most 50 characters).
    pub text: String,
    /// Whether the peer should tear the call down.
    pub should_terminate: bool,
    /// Generator confidence in [0, 1].
    pub confidence: f64,
    /// Strategy wire name.
    pub strategy: crate::types::ResponseStrategy,
}

/// Liveness probe payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Sender clock at emission (ms since epoch).
    pub sent_at: u64,
}

/// Transport status change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusPayload {
    /// Close/status code (1000, 1001, 1008, 1011).
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// Pipeline progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatusPayload {
    /// Owning call.
    pub call_id: CallId,
    /// Chunk the status refers to, when chunk-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    /// Stage name: `audio_received`, `response_sent`, `rejected`, ...
    pub stage: String,
}

/// Component metric readings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    /// Emitting component.
    pub component: String,
    /// Gauge name to value.
    #[serde(default)]
    pub gauges: BTreeMap<String, f64>,
}

/// Structured failure notification sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Taxonomy kind wire name.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the caller may retry.
    pub retryable: bool,
    /// Back-off hint for retryable failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Media signaling payload forwarded between room peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalForwardPayload {
    /// Room the peers share.
    pub room_id: String,
    /// Originating peer; stamped by the hub.
    pub from_peer_id: String,
    /// Destination peer.
    pub target_peer_id: String,
    /// Opaque negotiation body (SDP or candidate).
    pub data: serde_json::Value,
}

/// Reattach a dropped connection to a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecoveryPayload {
    /// Session to recover.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Call the session observes.
    pub call_id: CallId,
    /// Last sequence number the peer observed, for resync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
}

/// Delivery acknowledgement. Carries the status only; the envelope `id`
/// of an ack equals the id of the message being acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    /// Always `received` on successful validation.
    pub status: String,
}

/// Typed payload union over the closed message-type set.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// `audio_chunk`
    AudioChunk(AudioChunkPayload),
    /// `audio_response`
    AudioResponse(AudioResponsePayload),
    /// `transcript`
    Transcript(TranscriptPayload),
    /// `ai_response`
    AiResponse(AiResponsePayload),
    /// `heartbeat`
    Heartbeat(HeartbeatPayload),
    /// `connection_status`
    ConnectionStatus(ConnectionStatusPayload),
    /// `processing_status`
    ProcessingStatus(ProcessingStatusPayload),
    /// `metrics`
    Metrics(MetricsPayload),
    /// `error`
    Error(ErrorPayload),
    /// `webrtc_offer`
    WebrtcOffer(SignalForwardPayload),
    /// `webrtc_answer`
    WebrtcAnswer(SignalForwardPayload),
    /// `webrtc_ice_candidate`
    WebrtcIceCandidate(SignalForwardPayload),
    /// `session_recovery`
    SessionRecovery(SessionRecoveryPayload),
    /// `ack`
    Ack(AckPayload),
}

impl MessagePayload {
    /// Message type tag for this payload.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::AudioChunk(_) => MessageType::AudioChunk,
            Self::AudioResponse(_) => MessageType::AudioResponse,
            Self::Transcript(_) => MessageType::Transcript,
            Self::AiResponse(_) => MessageType::AiResponse,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::ConnectionStatus(_) => MessageType::ConnectionStatus,
            Self::ProcessingStatus(_) => MessageType::ProcessingStatus,
            Self::Metrics(_) => MessageType::Metrics,
            Self::Error(_) => MessageType::Error,
            Self::WebrtcOffer(_) => MessageType::WebrtcOffer,
            Self::WebrtcAnswer(_) => MessageType::WebrtcAnswer,
            Self::WebrtcIceCandidate(_) => MessageType::WebrtcIceCandidate,
            Self::SessionRecovery(_) => MessageType::SessionRecovery,
            Self::Ack(_) => MessageType::Ack,
        }
    }

    /// Parse a raw JSON payload against the declared message type.
    ///
    /// # Errors
    /// Returns a validation error when the value does not match the typed
    /// shape for `message_type`.
    pub fn from_value(message_type: MessageType, value: serde_json::Value) -> Result<Self> {
        let payload = match message_type {
            MessageType::AudioChunk => Self::AudioChunk(serde_json::from_value(value)?),
            MessageType::AudioResponse => Self::AudioResponse(serde_json::from_value(value)?),
            MessageType::Transcript => Self::Transcript(serde_json::from_value(value)?),
            MessageType::AiResponse => Self::AiResponse(serde_json::from_value(value)?),
            MessageType::Heartbeat => Self::Heartbeat(serde_json::from_value(value)?),
            MessageType::ConnectionStatus => Self::ConnectionStatus(serde_json::from_value(value)?),
            MessageType::ProcessingStatus => Self::ProcessingStatus(serde_json::from_value(value)?),
            MessageType::Metrics => Self::Metrics(serde_json::from_value(value)?),
            MessageType::Error => Self::Error(serde_json::from_value(value)?),
            MessageType::WebrtcOffer => Self::WebrtcOffer(serde_json::from_value(value)?),
            MessageType::WebrtcAnswer => Self::WebrtcAnswer(serde_json::from_value(value)?),
            MessageType::WebrtcIceCandidate => {
                Self::WebrtcIceCandidate(serde_json::from_value(value)?)
            }
            MessageType::SessionRecovery => Self::SessionRecovery(serde_json::from_value(value)?),
            MessageType::Ack => Self::Ack(serde_json::from_value(value)?),
        };
        Ok(payload)
    }

    /// Canonical JSON value of this payload (object keys sorted).
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::AudioChunk(p) => serde_json::to_value(p)?,
            Self::AudioResponse(p) => serde_json::to_value(p)?,
            Self::Transcript(p) => serde_json::to_value(p)?,
            Self::AiResponse(p) => serde_json::to_value(p)?,
            Self::Heartbeat(p) => serde_json::to_value(p)?,
            Self::ConnectionStatus(p) => serde_json::to_value(p)?,
            Self::ProcessingStatus(p) => serde_json::to_value(p)?,
            Self::Metrics(p) => serde_json::to_value(p)?,
            Self::Error(p) => serde_json::to_value(p)?,
            Self::WebrtcOffer(p) | Self::WebrtcAnswer(p) | Self::WebrtcIceCandidate(p) => {
                serde_json::to_value(p)?
            }
            Self::SessionRecovery(p) => serde_json::to_value(p)?,
            Self::Ack(p) => serde_json::to_value(p)?,
        };
        Ok(value)
    }
}

/// Routing and delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    /// Emitting component or connection.
    pub source: String,
    /// Destination, when directed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Delivery priority.
    #[serde(default)]
    pub priority: Priority,
    /// Time-to-live in milliseconds from `timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Correlation id tying request and reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    /// Payload encoding label; `json` unless stated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl EnvelopeMetadata {
    /// Metadata with defaults for the given source.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
            priority: Priority::Normal,
            ttl: None,
            correlation: None,
            encoding: None,
        }
    }
}

/// Serialized form of the envelope; `payload` stays raw so the compressed
/// and uncompressed representations share one shape.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    version: String,
    #[serde(rename = "type")]
    message_type: String,
    id: String,
    timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compressed: Option<bool>,
    checksum: String,
    payload: serde_json::Value,
    metadata: EnvelopeMetadata,
}

/// A validated protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Protocol version; always `2.0` after validation.
    pub version: String,
    /// Unique message id. For acks, the id of the acknowledged message.
    pub id: String,
    /// Emission timestamp (ms since epoch).
    pub timestamp: u64,
    /// Per-connection sequence number, when assigned.
    pub sequence_number: Option<u64>,
    /// Whether the sender expects an acknowledgement.
    pub ack_required: bool,
    /// Retransmission count; zero on first send.
    pub retry: u32,
    /// Typed payload.
    pub payload: MessagePayload,
    /// Routing metadata.
    pub metadata: EnvelopeMetadata,
}

impl Envelope {
    /// Build a new envelope around a payload.
    ///
    /// Assigns a fresh uuid and the current timestamp. Acks are the only
    /// exception to fresh ids; use [`Envelope::ack_for`].
    #[must_use]
    pub fn new(payload: MessagePayload, source: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            sequence_number: None,
            ack_required: false,
            retry: 0,
            payload,
            metadata: EnvelopeMetadata::new(source),
        }
    }

    /// Build the acknowledgement for a received envelope.
    ///
    /// The ack reuses the acknowledged message's id, is never itself
    /// `ackRequired`, and is exempt from receiver-side duplicate tracking.
    #[must_use]
    pub fn ack_for(received: &Envelope, source: impl Into<String>) -> Self {
        let mut ack = Self::new(
            MessagePayload::Ack(AckPayload {
                status: "received".to_string(),
            }),
            source,
        );
        ack.id = received.id.clone();
        ack.metadata.target = Some(received.metadata.source.clone());
        ack.metadata.correlation = received.metadata.correlation.clone();
        ack
    }

    /// Set the delivery priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Request an acknowledgement for this envelope.
    #[must_use]
    pub fn with_ack_required(mut self) -> Self {
        self.ack_required = true;
        self
    }

    /// Set the destination.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.metadata.target = Some(target.into());
        self
    }

    /// Set the time-to-live in milliseconds.
    #[must_use]
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.metadata.ttl = Some(ttl_ms);
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.metadata.correlation = Some(correlation.into());
        self
    }

    /// Message type of the payload.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Whether the reliability layer must track this envelope.
    ///
    /// True when the sender asked for an ack or the priority is high or
    /// above. Acks themselves are never tracked.
    #[must_use]
    pub fn needs_ack(&self) -> bool {
        if self.message_type() == MessageType::Ack {
            return false;
        }
        self.ack_required || self.metadata.priority >= Priority::High
    }

    /// Whether this envelope has outlived its TTL relative to `now` (ms).
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        match self.metadata.ttl {
            Some(ttl) => now.saturating_sub(self.timestamp) > ttl,
            None => false,
        }
    }

    /// Serialize to a wire frame with the default compression threshold.
    ///
    /// # Errors
    /// Fails when the payload cannot be serialized or the resulting frame
    /// exceeds [`MAX_FRAME_SIZE`].
    pub fn encode(&self) -> Result<String> {
        self.encode_with_threshold(DEFAULT_COMPRESSION_THRESHOLD)
    }

    /// Serialize to a wire frame, compressing payloads over `threshold`.
    pub fn encode_with_threshold(&self, threshold: usize) -> Result<String> {
        let payload_value = self.payload.to_value()?;
        let payload_json = serde_json::to_string(&payload_value)?;
        let checksum = envelope_checksum(
            self.message_type().as_str(),
            &self.id,
            self.timestamp,
            &payload_json,
        );

        let (payload, compressed) = if payload_json.len() > threshold {
            let packed = zstd::encode_all(payload_json.as_bytes(), COMPRESSION_LEVEL)
                .map_err(|e| CoreError::Invalid(format!("compression failed: {e}")))?;
            use base64::Engine as _;
            let encoded = base64::engine::general_purpose::STANDARD.encode(packed);
            (serde_json::Value::String(encoded), Some(true))
        } else {
            (payload_value, None)
        };

        let wire = WireEnvelope {
            version: self.version.clone(),
            message_type: self.message_type().as_str().to_string(),
            id: self.id.clone(),
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
            ack_required: self.ack_required.then_some(true),
            retry: (self.retry > 0).then_some(self.retry),
            compressed,
            checksum,
            payload,
            metadata: self.metadata.clone(),
        };

        let frame = serde_json::to_string(&wire)?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CoreError::FrameTooLarge(frame.len()));
        }
        Ok(frame)
    }

    /// Parse and validate a wire frame.
    ///
    /// Validation order: frame size, JSON shape, version, required fields,
    /// decompression, checksum, TTL. Duplicate suppression happens later in
    /// the reliability layer, not here.
    ///
    /// # Errors
    /// Returns the matching [`CoreError`] for each validation failure.
    pub fn decode(frame: &str) -> Result<Self> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CoreError::FrameTooLarge(frame.len()));
        }

        let wire: WireEnvelope =
            serde_json::from_str(frame).map_err(|e| CoreError::Invalid(e.to_string()))?;

        if wire.version != PROTOCOL_VERSION {
            return Err(CoreError::Version(wire.version));
        }
        if wire.id.is_empty() {
            return Err(CoreError::MissingField("id"));
        }
        if wire.checksum.is_empty() {
            return Err(CoreError::MissingField("checksum"));
        }
        if wire.metadata.source.is_empty() {
            return Err(CoreError::MissingField("metadata.source"));
        }

        let message_type = MessageType::parse(&wire.message_type)?;

        let payload_value = if wire.compressed.unwrap_or(false) {
            let serde_json::Value::String(encoded) = &wire.payload else {
                return Err(CoreError::Invalid(
                    "compressed payload must be a base64 string".to_string(),
                ));
            };
            use base64::Engine as _;
            let packed = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| CoreError::Decompression(e.to_string()))?;
            let raw = zstd::decode_all(packed.as_slice())
                .map_err(|e| CoreError::Decompression(e.to_string()))?;
            serde_json::from_slice(&raw).map_err(|e| CoreError::Decompression(e.to_string()))?
        } else {
            wire.payload
        };

        let payload_json = serde_json::to_string(&payload_value)?;
        let computed = envelope_checksum(
            message_type.as_str(),
            &wire.id,
            wire.timestamp,
            &payload_json,
        );
        if computed != wire.checksum {
            return Err(CoreError::ChecksumMismatch {
                expected: wire.checksum,
                computed,
            });
        }

        let envelope = Self {
            version: wire.version,
            id: wire.id,
            timestamp: wire.timestamp,
            sequence_number: wire.sequence_number,
            ack_required: wire.ack_required.unwrap_or(false),
            retry: wire.retry.unwrap_or(0),
            payload: MessagePayload::from_value(message_type, payload_value)?,
            metadata: wire.metadata,
        };

        if envelope.is_expired(now_ms()) {
            return Err(CoreError::Expired(envelope.id));
        }

        Ok(envelope)
    }
}

/// Serde adapter: `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize base64 into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as an optional base64 string.
pub mod opt_base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize optional bytes as base64.
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional base64 into bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Envelope {
        Envelope::new(
            MessagePayload::Heartbeat(HeartbeatPayload { sent_at: now_ms() }),
            "test",
        )
    }

    fn sample_chunk_payload(size: usize) -> MessagePayload {
        MessagePayload::AudioChunk(AudioChunkPayload {
            id: "chunk-1".into(),
            call_id: "call-1".into(),
            sequence_number: 1,
            timestamp: 1_700_000_000_000,
            sample_rate: 16_000,
            channels: 1,
            encoding: AudioEncoding::Pcm,
            audio_data: vec![0u8; size],
        })
    }

    #[test]
    fn test_round_trip_heartbeat() {
        let env = heartbeat();
        let frame = env.encode().unwrap();
        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.message_type(), MessageType::Heartbeat);
    }

    #[test]
    fn test_round_trip_audio_chunk() {
        let env = Envelope::new(sample_chunk_payload(256), "gateway")
            .with_priority(Priority::High)
            .with_target("pipeline");
        let frame = env.encode().unwrap();
        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back, env);
        assert!(back.needs_ack());
    }

    #[test]
    fn test_wire_field_names() {
        let mut env = heartbeat();
        env.sequence_number = Some(9);
        env.ack_required = true;
        let frame = env.encode().unwrap();
        assert!(frame.contains("\"version\":\"2.0\""));
        assert!(frame.contains("\"type\":\"heartbeat\""));
        assert!(frame.contains("\"sequenceNumber\":9"));
        assert!(frame.contains("\"ackRequired\":true"));
        assert!(frame.contains("\"checksum\":\""));
        assert!(frame.contains("\"metadata\":{"));
        // Unset optionals stay off the wire.
        assert!(!frame.contains("\"retry\""));
        assert!(!frame.contains("\"compressed\""));
    }

    #[test]
    fn test_compression_round_trip() {
        // Large payload compresses; small one does not.
        let env = Envelope::new(sample_chunk_payload(64 * 1024), "gateway");
        let frame = env.encode().unwrap();
        assert!(frame.contains("\"compressed\":true"));
        // Zeros compress well below the base64-expanded raw size.
        assert!(frame.len() < 64 * 1024);
        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_checksum_tamper_detected() {
        let env = Envelope::new(
            MessagePayload::Transcript(TranscriptPayload {
                call_id: "call-1".into(),
                chunk_id: "chunk-1".into(),
                text: "hello".into(),
                confidence: 0.9,
            }),
            "pipeline",
        );
        let frame = env.encode().unwrap();
        let tampered = frame.replace("\"hello\"", "\"jello\"");
        assert!(matches!(
            Envelope::decode(&tampered),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let frame = heartbeat().encode().unwrap();
        let bad = frame.replace("\"version\":\"2.0\"", "\"version\":\"1.0\"");
        assert!(matches!(Envelope::decode(&bad), Err(CoreError::Version(v)) if v == "1.0"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = heartbeat().encode().unwrap();
        let bad = frame.replace("\"type\":\"heartbeat\"", "\"type\":\"mystery\"");
        assert!(matches!(Envelope::decode(&bad), Err(CoreError::Invalid(_))));
    }

    #[test]
    fn test_expired_ttl_rejected() {
        let mut env = heartbeat().with_ttl(10);
        env.timestamp = now_ms().saturating_sub(60_000);
        let frame = env.encode().unwrap();
        assert!(matches!(Envelope::decode(&frame), Err(CoreError::Expired(_))));
    }

    #[test]
    fn test_ttl_within_budget_accepted() {
        let env = heartbeat().with_ttl(60_000);
        let frame = env.encode().unwrap();
        assert!(Envelope::decode(&frame).is_ok());
    }

    #[test]
    fn test_ack_shares_id_and_never_needs_ack() {
        let original = heartbeat().with_ack_required().with_correlation("corr-1");
        let ack = Envelope::ack_for(&original, "receiver");
        assert_eq!(ack.id, original.id);
        assert_eq!(ack.metadata.target.as_deref(), Some("test"));
        assert_eq!(ack.metadata.correlation.as_deref(), Some("corr-1"));
        assert!(!ack.needs_ack());
        let MessagePayload::Ack(payload) = &ack.payload else {
            panic!("expected ack payload");
        };
        assert_eq!(payload.status, "received");
    }

    #[test]
    fn test_priority_implies_ack() {
        assert!(!heartbeat().needs_ack());
        assert!(heartbeat().with_priority(Priority::High).needs_ack());
        assert!(heartbeat().with_priority(Priority::Urgent).needs_ack());
        assert!(!heartbeat().with_priority(Priority::Low).needs_ack());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(CoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_payload_shape_mismatch_rejected() {
        // transcript type with heartbeat-shaped payload
        let env = heartbeat();
        let frame = env.encode().unwrap();
        let bad = frame.replace("\"type\":\"heartbeat\"", "\"type\":\"transcript\"");
        // Checksum covers the type, so this trips integrity first.
        assert!(Envelope::decode(&bad).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        // A payload of random (incompressible) bytes past the frame cap.
        let mut bytes = vec![0u8; MAX_FRAME_SIZE];
        let mut seed = 0x12345678u32;
        for b in &mut bytes {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            *b = (seed >> 24) as u8;
        }
        let env = Envelope::new(
            MessagePayload::AudioChunk(AudioChunkPayload {
                id: "chunk-big".into(),
                call_id: "call-1".into(),
                sequence_number: 1,
                timestamp: now_ms(),
                sample_rate: 48_000,
                channels: 2,
                encoding: AudioEncoding::Pcm,
                audio_data: bytes,
            }),
            "gateway",
        );
        assert!(matches!(env.encode(), Err(CoreError::FrameTooLarge(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_transcript_round_trip(text in ".{0,120}", confidence in 0.0f64..=1.0) {
                let env = Envelope::new(
                    MessagePayload::Transcript(TranscriptPayload {
                        call_id: "call-p".into(),
                        chunk_id: "chunk-p".into(),
                        text,
                        confidence,
                    }),
                    "pipeline",
                );
                let frame = env.encode().unwrap();
                let back = Envelope::decode(&frame).unwrap();
                prop_assert_eq!(back, env);
            }

            #[test]
            fn prop_audio_round_trip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
                let env = Envelope::new(
                    MessagePayload::AudioChunk(AudioChunkPayload {
                        id: "chunk-p".into(),
                        call_id: "call-p".into(),
                        sequence_number: 0,
                        timestamp: 1,
                        sample_rate: 8_000,
                        channels: 1,
                        encoding: AudioEncoding::Opus,
                        audio_data: data,
                    }),
                    "gateway",
                );
                let frame = env.encode().unwrap();
                let back = Envelope::decode(&frame).unwrap();
                prop_assert_eq!(back, env);
            }
        }
    }
}
