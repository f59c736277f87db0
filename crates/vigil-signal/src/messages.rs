//! Signaling message shapes.
//!
//! Messages between peers and the hub use a small closed set of types.
//! Negotiation bodies (`data`) are opaque JSON; the hub stamps the
//! originating peer and delivers without inspection.

use serde::{Deserialize, Serialize};
use vigil_core::types::now_ms;

/// The closed set of signaling message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalMessageType {
    /// Client request to join a room.
    JoinRoom,
    /// Client request to leave a room.
    LeaveRoom,
    /// Media negotiation offer, forwarded peer to peer.
    Offer,
    /// Media negotiation answer, forwarded peer to peer.
    Answer,
    /// ICE candidate, forwarded peer to peer.
    IceCandidate,
    /// Hub notification: a peer joined the room.
    PeerJoined,
    /// Hub notification: a peer left the room.
    PeerLeft,
}

/// Kind of peer-to-peer forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardKind {
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Trickle ICE candidate.
    IceCandidate,
}

impl ForwardKind {
    /// Signaling message type for this forward kind.
    #[must_use]
    pub fn message_type(self) -> SignalMessageType {
        match self {
            Self::Offer => SignalMessageType::Offer,
            Self::Answer => SignalMessageType::Answer,
            Self::IceCandidate => SignalMessageType::IceCandidate,
        }
    }
}

/// A signaling frame between the hub and a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: SignalMessageType,
    /// Room the message concerns.
    pub room_id: String,
    /// Peer the message is about (joiner, leaver, or sender).
    pub peer_id: String,
    /// Destination peer for forwarded messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    /// Opaque body.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Emission timestamp (ms since epoch).
    pub timestamp: u64,
}

impl SignalMessage {
    /// Build a hub notification about `peer_id` in `room_id`.
    #[must_use]
    pub fn notification(
        message_type: SignalMessageType,
        room_id: &str,
        peer_id: &str,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_type,
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            target_peer_id: None,
            data,
            timestamp: now_ms(),
        }
    }
}
