//! Error taxonomy for the VIGIL core.
//!
//! Every failure carries a structured [`ErrorKind`] that decides two
//! things: whether the caller may retry, and what the peer sees. The
//! propagation policy is strict containment: stage failures never escape a
//! chunk, chunk failures never close a session, session failures never
//! affect other sessions.

use thiserror::Error;

/// Structured failure classification: `{kind, retryable, surface}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-contract input. Never retried.
    Validation,
    /// Caller exceeded a rate limit and should back off.
    RateLimit,
    /// Transport-level connection failure.
    Connection,
    /// Per-chunk audio processing failure; the pipeline continues.
    AudioProcessing,
    /// External stage dependency failure (recognizer / intent / synth).
    StageDependency,
    /// Envelope failed to parse.
    ProtocolInvalid,
    /// Envelope checksum mismatch.
    ProtocolIntegrity,
    /// Envelope exceeded its TTL.
    ProtocolExpired,
    /// Delivery failed after the maximum retransmissions.
    ProtocolDeliveryFailed,
    /// Per-call queue is full; caller may retry after a delay.
    Backpressure,
    /// Connection pool is exhausted.
    PoolExhausted,
    /// Per-user connection or session cap reached.
    UserLimit,
    /// Operation exceeded its deadline.
    Timeout,
    /// Unhandled invariant; the owning session terminates.
    Fatal,
}

impl ErrorKind {
    /// Whether a caller may usefully retry the failed operation.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::AudioProcessing
                | Self::StageDependency
                | Self::Backpressure
                | Self::PoolExhausted
                | Self::UserLimit
                | Self::Timeout
        )
    }

    /// Stable wire name for `error` frames and counters.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::Connection => "connection",
            Self::AudioProcessing => "audio_processing",
            Self::StageDependency => "stage_dependency",
            Self::ProtocolInvalid => "protocol_invalid",
            Self::ProtocolIntegrity => "protocol_integrity",
            Self::ProtocolExpired => "protocol_expired",
            Self::ProtocolDeliveryFailed => "protocol_delivery_failed",
            Self::Backpressure => "backpressure",
            Self::PoolExhausted => "pool_exhausted",
            Self::UserLimit => "user_limit",
            Self::Timeout => "timeout",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors produced by the core protocol layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Envelope failed to parse as JSON or as a known message shape.
    #[error("invalid envelope: {0}")]
    Invalid(String),

    /// Envelope version is not supported.
    #[error("unsupported protocol version: {0}")]
    Version(String),

    /// A required envelope field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Checksum carried by the envelope.
        expected: String,
        /// Checksum computed over the received fields.
        computed: String,
    },

    /// Envelope exceeded its TTL before processing.
    #[error("envelope {0} expired in transit")]
    Expired(String),

    /// Serialized frame exceeds the maximum frame size.
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    /// Payload decompression failed.
    #[error("payload decompression failed: {0}")]
    Decompression(String),

    /// Delivery failed after the configured retransmission budget.
    #[error("delivery of {id} failed after {retries} retries")]
    DeliveryFailed {
        /// Envelope id that could not be delivered.
        id: String,
        /// Number of retransmissions attempted.
        retries: u32,
    },

    /// The underlying send function reported a failure.
    #[error("send failed: {0}")]
    Send(String),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    /// Classify this error into the service-wide taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_)
            | Self::Version(_)
            | Self::MissingField(_)
            | Self::FrameTooLarge(_)
            | Self::Decompression(_)
            | Self::Serde(_) => ErrorKind::ProtocolInvalid,
            Self::ChecksumMismatch { .. } => ErrorKind::ProtocolIntegrity,
            Self::Expired(_) => ErrorKind::ProtocolExpired,
            Self::DeliveryFailed { .. } => ErrorKind::ProtocolDeliveryFailed,
            Self::Send(_) => ErrorKind::Connection,
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!ErrorKind::Validation.retryable());
        assert!(!ErrorKind::ProtocolIntegrity.retryable());
        assert!(!ErrorKind::Fatal.retryable());
        assert!(ErrorKind::Backpressure.retryable());
        assert!(ErrorKind::StageDependency.retryable());
        assert!(ErrorKind::Timeout.retryable());
    }

    #[test]
    fn test_wire_names_are_stable() {
        assert_eq!(ErrorKind::ProtocolInvalid.as_str(), "protocol_invalid");
        assert_eq!(
            ErrorKind::ProtocolDeliveryFailed.as_str(),
            "protocol_delivery_failed"
        );
        assert_eq!(ErrorKind::UserLimit.as_str(), "user_limit");
    }

    #[test]
    fn test_core_error_kinds() {
        let err = CoreError::ChecksumMismatch {
            expected: "aa".into(),
            computed: "bb".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ProtocolIntegrity);

        let err = CoreError::Expired("id-1".into());
        assert_eq!(err.kind(), ErrorKind::ProtocolExpired);

        let err = CoreError::DeliveryFailed {
            id: "id-2".into(),
            retries: 3,
        };
        assert_eq!(err.kind(), ErrorKind::ProtocolDeliveryFailed);
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::FrameTooLarge(3_000_000);
        assert!(err.to_string().contains("3000000"));
    }
}
