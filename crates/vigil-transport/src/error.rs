//! Error types for the transport layer.

use thiserror::Error;

/// Errors produced by transports, sessions, and the pool.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Listener could not be created.
    #[error("bind failed: {0}")]
    BindFailed(String),

    /// Outbound connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// Frame exceeded the maximum size.
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    /// Media negotiation or channel failure.
    #[error("media transport failed: {0}")]
    MediaFailed(String),

    /// A session for this `(user, call)` pair already exists.
    #[error("duplicate session for user {user} call {call}")]
    DuplicateSession {
        /// Owning user.
        user: String,
        /// Observed call.
        call: String,
    },

    /// Referenced session does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session cannot be recovered (window elapsed or state mismatch).
    #[error("session recovery rejected: {0}")]
    RecoveryRejected(String),

    /// Per-user connection cap reached.
    #[error("user {0} exceeded the connection limit")]
    UserLimitExceeded(String),

    /// Pool is at capacity and no eviction was possible.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Queued acquire timed out before a connection freed up.
    #[error("acquire timed out after {0}ms in the waiting queue")]
    AcquireTimeout(u64),

    /// The pool is shutting down; waiters are drained with this error.
    #[error("pool shutdown")]
    PoolShutdown,

    /// Referenced connection does not exist.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "transport closed");
        let err = TransportError::AcquireTimeout(1500);
        assert!(err.to_string().contains("1500"));
    }
}
