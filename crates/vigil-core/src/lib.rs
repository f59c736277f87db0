//! # VIGIL Core
//!
//! Core protocol layer for the VIGIL voice processing service.
//!
//! This crate provides:
//! - The versioned message [`envelope`] used on every service boundary
//! - A 32-bit integrity [`checksum`] over the envelope identity fields
//! - A [`registry`] dispatching typed messages to pluggable handlers
//! - The [`reliability`] layer: acknowledgements, retransmission, and
//!   duplicate suppression for at-least-once delivery
//! - Shared domain [`types`] (calls, chunks, intents, responses)
//! - The service-wide [`config`] tree and [`error`] taxonomy
//!
//! Every message that crosses a connection is an [`envelope::Envelope`]:
//! a self-describing JSON frame carrying a typed payload. The receive path
//! validates version, required fields, checksum, and TTL before the
//! reliability layer suppresses duplicates and the registry dispatches the
//! payload to its handler.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod registry;
pub mod reliability;
pub mod types;

pub use envelope::{Envelope, EnvelopeMetadata, MessagePayload, MessageType, Priority};
pub use error::{CoreError, ErrorKind, Result};
pub use registry::{Handler, HandlerOutcome, HandlerRegistry};
pub use reliability::{ReliabilityConfig, ReliabilityLayer};

/// Protocol version accepted by this implementation.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Maximum serialized frame size in bytes (2 MB).
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;
