//! Message dispatch registry.
//!
//! A [`Handler`] is registered per message type; the registry routes each
//! validated envelope to its handler. Types with no handler are surfaced
//! as [`ProtocolEvent::UnhandledMessage`] events rather than dropped, so a
//! composition root can observe traffic it has not wired up yet.

use crate::envelope::{Envelope, MessageType};
use crate::events::{EventBus, ProtocolEvent};
use crate::types::ConnectionId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Outcome of handling one envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandlerOutcome {
    /// Whether the handler consumed the message.
    pub handled: bool,
    /// Optional structured result for the dispatcher.
    pub data: Option<serde_json::Value>,
}

impl HandlerOutcome {
    /// A consumed message with no result data.
    #[must_use]
    pub fn handled() -> Self {
        Self {
            handled: true,
            data: None,
        }
    }

    /// A consumed message carrying result data.
    #[must_use]
    pub fn with_data(data: serde_json::Value) -> Self {
        Self {
            handled: true,
            data: Some(data),
        }
    }
}

/// A message handler bound to one message type.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle a validated envelope received on `connection_id`.
    async fn handle(&self, envelope: &Envelope, connection_id: &ConnectionId) -> HandlerOutcome;
}

/// Adapter wrapping a synchronous closure as a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Envelope, &ConnectionId) -> HandlerOutcome + Send + Sync,
{
    async fn handle(&self, envelope: &Envelope, connection_id: &ConnectionId) -> HandlerOutcome {
        (self.0)(envelope, connection_id)
    }
}

/// Registry mapping message types to handlers.
pub struct HandlerRegistry {
    handlers: DashMap<MessageType, Arc<dyn Handler>>,
    events: EventBus,
}

impl HandlerRegistry {
    /// Create an empty registry publishing to `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            handlers: DashMap::new(),
            events,
        }
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(&self, message_type: MessageType, handler: Arc<dyn Handler>) {
        self.handlers.insert(message_type, handler);
    }

    /// Remove the handler for `message_type`.
    pub fn unregister(&self, message_type: MessageType) -> bool {
        self.handlers.remove(&message_type).is_some()
    }

    /// Whether a handler is registered for `message_type`.
    #[must_use]
    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch an envelope to its handler.
    ///
    /// Returns `None` (after publishing [`ProtocolEvent::UnhandledMessage`])
    /// when no handler is registered for the envelope's type.
    pub async fn dispatch(
        &self,
        envelope: &Envelope,
        connection_id: &ConnectionId,
    ) -> Option<HandlerOutcome> {
        let message_type = envelope.message_type();
        let handler = self.handlers.get(&message_type).map(|h| Arc::clone(&h));
        match handler {
            Some(handler) => Some(handler.handle(envelope, connection_id).await),
            None => {
                tracing::debug!("no handler for {message_type} on {connection_id}");
                self.events.publish(ProtocolEvent::UnhandledMessage {
                    message_type,
                    connection_id: connection_id.clone(),
                });
                None
            }
        }
    }
}
