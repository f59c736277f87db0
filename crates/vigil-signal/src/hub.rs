//! The signaling hub.
//!
//! Holds the `roomId -> Room` map with secondary indices by peer and by
//! user, forwards negotiation messages between peers of the same room,
//! and runs the liveness / cleanup passes.
//!
//! # Liveness
//!
//! A peer silent past `peerTimeout` is probed once ([`SignalEvent::PeerPinged`];
//! the session layer turns this into a heartbeat toward the peer). Silence
//! for a further grace period terminates the peer as if it had left. Rooms
//! empty past a cleanup pass, or idle past `roomIdleMax`, are deleted.

use crate::error::{Result, SignalError};
use crate::messages::{ForwardKind, SignalMessage, SignalMessageType};
use crate::room::{PeerContext, Room};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_core::config::SignalConfig;
use vigil_core::types::{CallId, PeerId, UserId, now_ms};

/// Events published by the hub.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// A room was created by its first joiner.
    RoomCreated {
        /// Room identifier.
        room_id: String,
    },
    /// A room was deleted by the cleanup pass.
    RoomDestroyed {
        /// Room identifier.
        room_id: String,
    },
    /// A peer joined a room.
    PeerJoined {
        /// Room identifier.
        room_id: String,
        /// Joining peer.
        peer_id: PeerId,
    },
    /// A peer left a room.
    PeerLeft {
        /// Room identifier.
        room_id: String,
        /// Leaving peer.
        peer_id: PeerId,
    },
    /// A silent peer was probed; the session layer should ping it.
    PeerPinged {
        /// Probed peer.
        peer_id: PeerId,
    },
    /// A peer stayed silent through the grace period and was removed.
    PeerTimedOut {
        /// Terminated peer.
        peer_id: PeerId,
    },
}

/// Acknowledgement returned to a joining peer.
#[derive(Debug, Clone)]
pub struct JoinAck {
    /// Hub-assigned peer id.
    pub peer_id: PeerId,
    /// Whether the joiner is the room initiator.
    pub is_initiator: bool,
    /// Current members, oldest first, excluding the joiner.
    pub peers: Vec<PeerId>,
}

/// Counter snapshot for the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Rooms created.
    pub rooms_created: u64,
    /// Rooms destroyed by cleanup.
    pub rooms_destroyed: u64,
    /// Successful joins.
    pub peers_joined: u64,
    /// Peer-to-peer messages forwarded.
    pub forwards: u64,
    /// Peers terminated by the liveness pass.
    pub peer_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    rooms_created: AtomicU64,
    rooms_destroyed: AtomicU64,
    peers_joined: AtomicU64,
    forwards: AtomicU64,
    peer_timeouts: AtomicU64,
}

/// Signaling hub. Thread-safe; share via `Arc`.
pub struct SignalingHub {
    config: SignalConfig,
    rooms: DashMap<String, Room>,
    peers: DashMap<PeerId, PeerContext>,
    user_rooms: DashMap<UserId, HashSet<String>>,
    senders: DashMap<PeerId, mpsc::UnboundedSender<SignalMessage>>,
    events: broadcast::Sender<SignalEvent>,
    counters: Counters,
}

impl SignalingHub {
    /// Create a hub with the given configuration.
    #[must_use]
    pub fn new(config: SignalConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            rooms: DashMap::new(),
            peers: DashMap::new(),
            user_rooms: DashMap::new(),
            senders: DashMap::new(),
            events,
            counters: Counters::default(),
        }
    }

    /// Subscribe to hub events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SignalEvent) {
        let _ = self.events.send(event);
    }

    /// Deliver a message to one peer through its registered sender.
    fn deliver(&self, peer_id: &str, message: SignalMessage) -> Result<()> {
        let sender = self
            .senders
            .get(peer_id)
            .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?;
        sender
            .send(message)
            .map_err(|_| SignalError::DeliveryFailed(peer_id.to_string()))
    }

    /// Join a room, creating it on first join.
    ///
    /// The first joiner becomes the room initiator. Existing members are
    /// notified with `peer-joined`; the joiner receives the current peer
    /// list in the returned [`JoinAck`].
    ///
    /// # Errors
    /// Rejects when the user already holds `maxRoomsPerUser` rooms or the
    /// room is full.
    pub fn join(
        &self,
        user_id: &str,
        call_id: &str,
        room_id: &str,
        sender: mpsc::UnboundedSender<SignalMessage>,
    ) -> Result<JoinAck> {
        // Per-user room cap, counted before any mutation.
        let held = self
            .user_rooms
            .get(user_id)
            .map(|set| set.len())
            .unwrap_or(0);
        if held >= self.config.max_rooms_per_user {
            return Err(SignalError::UserRoomLimit(user_id.to_string()));
        }

        let peer_id = Uuid::new_v4().to_string();

        // Mutate the room under its entry lock so concurrent joiners
        // observe membership changes in one order.
        let (is_initiator, existing) = {
            let mut room = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| {
                    self.counters.rooms_created.fetch_add(1, Ordering::Relaxed);
                    self.publish(SignalEvent::RoomCreated {
                        room_id: room_id.to_string(),
                    });
                    Room::new(room_id, call_id, self.config.max_peers_per_room)
                });
            if room.is_full() {
                return Err(SignalError::RoomFull(room_id.to_string()));
            }
            let existing = room.peers.clone();
            let is_initiator = room.add_peer(&peer_id);
            (is_initiator, existing)
        };

        let now = now_ms();
        self.peers.insert(
            peer_id.clone(),
            PeerContext {
                peer_id: peer_id.clone(),
                user_id: user_id.to_string(),
                call_id: call_id.to_string(),
                room_id: room_id.to_string(),
                joined_at: now,
                last_activity_at: now,
                is_initiator,
                pinged_at: None,
            },
        );
        self.senders.insert(peer_id.clone(), sender);
        self.user_rooms
            .entry(user_id.to_string())
            .or_default()
            .insert(room_id.to_string());

        // Notify existing members.
        for member in &existing {
            let _ = self.deliver(
                member,
                SignalMessage::notification(
                    SignalMessageType::PeerJoined,
                    room_id,
                    &peer_id,
                    serde_json::json!({ "isInitiator": is_initiator }),
                ),
            );
        }

        self.counters.peers_joined.fetch_add(1, Ordering::Relaxed);
        self.publish(SignalEvent::PeerJoined {
            room_id: room_id.to_string(),
            peer_id: peer_id.clone(),
        });
        tracing::debug!("peer {peer_id} joined room {room_id} (initiator={is_initiator})");

        Ok(JoinAck {
            peer_id,
            is_initiator,
            peers: existing,
        })
    }

    /// Leave a room, notifying the remaining members.
    ///
    /// When the initiator leaves, the next oldest member takes over and
    /// the change rides on the `peer-left` notification.
    ///
    /// # Errors
    /// Fails when the peer is unknown.
    pub fn leave(&self, peer_id: &str) -> Result<()> {
        let Some((_, context)) = self.peers.remove(peer_id) else {
            return Err(SignalError::PeerNotFound(peer_id.to_string()));
        };
        self.senders.remove(peer_id);

        if let Some(mut set) = self.user_rooms.get_mut(&context.user_id) {
            set.remove(&context.room_id);
        }

        let (remaining, promoted) = {
            let Some(mut room) = self.rooms.get_mut(&context.room_id) else {
                return Ok(());
            };
            let promoted = room.remove_peer(peer_id);
            (room.peers.clone(), promoted)
        };

        if let Some(new_initiator) = &promoted {
            if let Some(mut peer) = self.peers.get_mut(new_initiator) {
                peer.is_initiator = true;
            }
            tracing::debug!(
                "peer {new_initiator} is the new initiator of room {}",
                context.room_id
            );
        }

        let data = match &promoted {
            Some(new_initiator) => serde_json::json!({ "newInitiator": new_initiator }),
            None => serde_json::Value::Null,
        };
        for member in &remaining {
            let _ = self.deliver(
                member,
                SignalMessage::notification(
                    SignalMessageType::PeerLeft,
                    &context.room_id,
                    peer_id,
                    data.clone(),
                ),
            );
        }

        self.publish(SignalEvent::PeerLeft {
            room_id: context.room_id.clone(),
            peer_id: peer_id.to_string(),
        });
        tracing::debug!("peer {peer_id} left room {}", context.room_id);
        Ok(())
    }

    /// Forward an offer / answer / candidate to one peer.
    ///
    /// Both peers must exist and share a room. The message is stamped
    /// with the originating peer and delivered to the target only.
    ///
    /// # Errors
    /// Fails when either peer is unknown, the peers are in different
    /// rooms, or delivery fails.
    pub fn forward(
        &self,
        from_peer: &str,
        target_peer: &str,
        kind: ForwardKind,
        data: serde_json::Value,
    ) -> Result<()> {
        let room_id = {
            let from = self
                .peers
                .get(from_peer)
                .ok_or_else(|| SignalError::PeerNotFound(from_peer.to_string()))?;
            let target = self
                .peers
                .get(target_peer)
                .ok_or_else(|| SignalError::PeerNotFound(target_peer.to_string()))?;
            if from.room_id != target.room_id {
                return Err(SignalError::NotInSameRoom {
                    from: from_peer.to_string(),
                    target: target_peer.to_string(),
                });
            }
            from.room_id.clone()
        };

        self.touch(from_peer);
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            room.last_activity_at = now_ms();
        }

        let message = SignalMessage {
            message_type: kind.message_type(),
            room_id,
            peer_id: from_peer.to_string(),
            target_peer_id: Some(target_peer.to_string()),
            data,
            timestamp: now_ms(),
        };
        self.deliver(target_peer, message)?;
        self.counters.forwards.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record inbound activity (any message or liveness pong) for a peer.
    pub fn touch(&self, peer_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.touch();
        }
    }

    /// Run one liveness pass: probe silent peers, terminate unresponsive
    /// ones. Returns the ids of terminated peers.
    pub fn liveness_pass(&self) -> Vec<PeerId> {
        let now = now_ms();
        let timeout = self.config.peer_timeout_ms;
        let grace = self.config.peer_grace_ms;

        let mut to_ping = Vec::new();
        let mut to_terminate = Vec::new();
        for mut peer in self.peers.iter_mut() {
            let silent_for = now.saturating_sub(peer.last_activity_at);
            match peer.pinged_at {
                None if silent_for > timeout => {
                    peer.pinged_at = Some(now);
                    to_ping.push(peer.peer_id.clone());
                }
                Some(pinged_at) if now.saturating_sub(pinged_at) > grace => {
                    to_terminate.push(peer.peer_id.clone());
                }
                _ => {}
            }
        }

        for peer_id in to_ping {
            tracing::debug!("probing silent peer {peer_id}");
            self.publish(SignalEvent::PeerPinged { peer_id });
        }
        for peer_id in &to_terminate {
            self.counters.peer_timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::info!("terminating unresponsive peer {peer_id}");
            let _ = self.leave(peer_id);
            self.publish(SignalEvent::PeerTimedOut {
                peer_id: peer_id.clone(),
            });
        }
        to_terminate
    }

    /// Run one cleanup pass: delete empty rooms and rooms idle beyond
    /// `roomIdleMax`. Returns the number of rooms deleted.
    pub fn cleanup_pass(&self) -> usize {
        let now = now_ms();
        let idle_max = self.config.room_idle_max_ms;
        let doomed: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| {
                room.is_empty() || now.saturating_sub(room.last_activity_at) > idle_max
            })
            .map(|room| room.key().clone())
            .collect();

        let mut deleted = 0;
        for room_id in doomed {
            // Evict any stragglers from an idle-expired room first.
            let members = self
                .rooms
                .get(&room_id)
                .map(|r| r.peers.clone())
                .unwrap_or_default();
            for member in members {
                let _ = self.leave(&member);
            }
            if self.rooms.remove(&room_id).is_some() {
                deleted += 1;
                self.counters.rooms_destroyed.fetch_add(1, Ordering::Relaxed);
                self.publish(SignalEvent::RoomDestroyed {
                    room_id: room_id.clone(),
                });
                tracing::debug!("deleted room {room_id}");
            }
        }
        deleted
    }

    /// Spawn the periodic liveness + cleanup maintenance task.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let interval = Duration::from_millis(hub.config.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                hub.liveness_pass();
                hub.cleanup_pass();
            }
        })
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of connected peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Snapshot of a room, when it exists.
    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Snapshot of a peer context, when it exists.
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<PeerContext> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// Call observed by a room, when the room exists.
    #[must_use]
    pub fn room_call(&self, room_id: &str) -> Option<CallId> {
        self.rooms.get(room_id).map(|r| r.call_id.clone())
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            rooms_created: self.counters.rooms_created.load(Ordering::Relaxed),
            rooms_destroyed: self.counters.rooms_destroyed.load(Ordering::Relaxed),
            peers_joined: self.counters.peers_joined.load(Ordering::Relaxed),
            forwards: self.counters.forwards.load(Ordering::Relaxed),
            peer_timeouts: self.counters.peer_timeouts.load(Ordering::Relaxed),
        }
    }
}
