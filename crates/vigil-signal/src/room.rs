//! Rooms and peer membership records.

use vigil_core::types::{CallId, PeerId, UserId, now_ms};

/// Per-peer signaling state.
#[derive(Debug, Clone)]
pub struct PeerContext {
    /// Hub-assigned peer identifier.
    pub peer_id: PeerId,
    /// Authenticated user behind the peer.
    pub user_id: UserId,
    /// Call the peer participates in.
    pub call_id: CallId,
    /// Room the peer belongs to. A peer belongs to at most one room.
    pub room_id: String,
    /// Join timestamp (ms since epoch).
    pub joined_at: u64,
    /// Last inbound activity (ms since epoch).
    pub last_activity_at: u64,
    /// Whether this peer currently initiates negotiation for new joins.
    pub is_initiator: bool,
    /// When the liveness probe was sent, if one is outstanding.
    pub pinged_at: Option<u64>,
}

impl PeerContext {
    /// Record inbound activity and clear any outstanding probe.
    pub fn touch(&mut self) {
        self.last_activity_at = now_ms();
        self.pinged_at = None;
    }
}

/// A room of peers negotiating media for one call.
#[derive(Debug, Clone)]
pub struct Room {
    /// Room identifier.
    pub room_id: String,
    /// Call this room serves.
    pub call_id: CallId,
    /// Member peer ids in join order; index 0 is the oldest member.
    pub peers: Vec<PeerId>,
    /// Creation timestamp (ms since epoch).
    pub created_at: u64,
    /// Last membership or forward activity (ms since epoch).
    pub last_activity_at: u64,
    /// Peer capacity.
    pub max_peers: usize,
}

impl Room {
    /// Create a room for `call_id` with the given capacity.
    #[must_use]
    pub fn new(room_id: &str, call_id: &str, max_peers: usize) -> Self {
        let now = now_ms();
        Self {
            room_id: room_id.to_string(),
            call_id: call_id.to_string(),
            peers: Vec::new(),
            created_at: now,
            last_activity_at: now,
            max_peers,
        }
    }

    /// Whether the room is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    /// Whether the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Add a peer; true when this peer became the first member.
    pub fn add_peer(&mut self, peer_id: &str) -> bool {
        let first = self.peers.is_empty();
        self.peers.push(peer_id.to_string());
        self.last_activity_at = now_ms();
        first
    }

    /// Remove a peer; returns the id of the new oldest member when the
    /// removed peer was at index 0 and members remain.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<PeerId> {
        let Some(index) = self.peers.iter().position(|p| p == peer_id) else {
            return None;
        };
        self.peers.remove(index);
        self.last_activity_at = now_ms();
        if index == 0 {
            self.peers.first().cloned()
        } else {
            None
        }
    }

    /// Whether `peer_id` is a member.
    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.iter().any(|p| p == peer_id)
    }
}
