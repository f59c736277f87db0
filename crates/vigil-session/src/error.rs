//! Error types for session lifecycle operations.

use thiserror::Error;

/// Errors produced by the session manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Referenced session does not exist or was invalidated.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Session expired (idle or absolute).
    #[error("session {0} expired")]
    Expired(String),

    /// Supplied device fingerprint does not match the bound one.
    #[error("device mismatch for session {0}")]
    DeviceMismatch(String),

    /// Session was marked compromised and invalidated.
    #[error("session {0} is compromised")]
    Compromised(String),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(
            SessionError::DeviceMismatch("s1".into())
                .to_string()
                .contains("s1")
        );
    }
}
