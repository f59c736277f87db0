//! Error types for the signaling hub.

use thiserror::Error;

/// Errors produced by signaling operations.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Room has reached its peer capacity.
    #[error("room {0} is full")]
    RoomFull(String),

    /// User holds the maximum number of rooms.
    #[error("user {0} reached the room limit")]
    UserRoomLimit(String),

    /// Referenced room does not exist.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Referenced peer does not exist.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Forwarding peers are not members of the same room.
    #[error("peers {from} and {target} are not in the same room")]
    NotInSameRoom {
        /// Originating peer.
        from: String,
        /// Destination peer.
        target: String,
    },

    /// The peer's outbound channel is gone.
    #[error("delivery to peer {0} failed")]
    DeliveryFailed(String),
}

/// Result type for signaling operations.
pub type Result<T> = std::result::Result<T, SignalError>;
