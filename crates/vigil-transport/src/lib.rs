//! # VIGIL Transport
//!
//! Transport fabric for the VIGIL voice service.
//!
//! This crate provides:
//! - The [`transport::Transport`] trait abstraction over frame channels
//! - A reliable WebSocket transport (ordered, framed, always present)
//! - A low-latency UDP media transport (optional, negotiated) with a
//!   recycled receive [`buffer_pool`]
//! - The [`session::SessionManager`]: per-peer session records with
//!   hybrid upgrade and fallback
//! - The [`pool::ConnectionPool`]: bounded connection inventory with
//!   per-user caps, priority eviction, reuse, and a waiting queue
//!
//! # Transport policy
//!
//! Every session starts on the reliable transport. When configured to
//! prefer media and negotiation succeeds, the session upgrades to
//! `hybrid`: audio flows on the media transport while control and text
//! stay on the reliable one. If media fails and fallback is enabled the
//! session reverts to `reliable`; otherwise it terminates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer_pool;
pub mod error;
pub mod media;
pub mod pool;
pub mod reliable;
pub mod session;
pub mod transport;

pub use buffer_pool::BufferPool;
pub use error::{Result, TransportError};
pub use pool::{AcquireRequest, ConnectionPool, ReleaseReason};
pub use session::{Session, SessionEvent, SessionManager, SessionState, TransportKind};
pub use transport::{Transport, TransportStats};
