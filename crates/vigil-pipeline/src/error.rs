//! Error types for the audio pipeline.

use thiserror::Error;
use vigil_core::error::ErrorKind;

/// Errors produced by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Chunk failed validation before processing.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// Declared encoding has no registered decoder.
    #[error("no decoder for encoding {0}")]
    UnsupportedEncoding(&'static str),

    /// Per-call queue is full.
    #[error("call {0} queue is full")]
    Backpressure(String),

    /// The call's worker is gone (session closed).
    #[error("call {0} is not accepting chunks")]
    CallClosed(String),

    /// An external stage dependency failed beyond its fallback.
    #[error("stage {stage} failed: {message}")]
    StageFailed {
        /// Offending stage name.
        stage: &'static str,
        /// Failure description.
        message: String,
    },

    /// Stage exceeded its deadline.
    #[error("stage {0} timed out")]
    StageTimeout(&'static str),
}

impl PipelineError {
    /// Classify into the service-wide taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidChunk(_) | Self::UnsupportedEncoding(_) => ErrorKind::Validation,
            Self::Backpressure(_) => ErrorKind::Backpressure,
            Self::CallClosed(_) => ErrorKind::Connection,
            Self::StageFailed { .. } => ErrorKind::StageDependency,
            Self::StageTimeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
