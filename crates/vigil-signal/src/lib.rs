//! # VIGIL Signaling
//!
//! Signaling hub for peer media negotiation.
//!
//! Peers join rooms keyed by `roomId`; the hub forwards offer / answer /
//! ICE candidate messages between peers of the same room, broadcasts
//! membership changes, and enforces liveness. The first joiner of a room
//! is its initiator; when the initiator leaves, the next oldest joiner
//! takes over and all peers are notified.
//!
//! The hub never inspects negotiation bodies; `data` is opaque. Delivery
//! to each peer goes through the unbounded sender registered at join
//! time, so membership notifications are observed by any given peer in
//! the order the hub applied them to the room.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hub;
pub mod messages;
pub mod room;

pub use error::{Result, SignalError};
pub use hub::{SignalEvent, SignalingHub};
pub use messages::{ForwardKind, SignalMessage, SignalMessageType};
pub use room::{PeerContext, Room};
