//! Typed protocol events.
//!
//! Components expose a small closed set of events on a broadcast channel.
//! Events carry only immutable values; consumers subscribe and never reach
//! into component state.

use crate::envelope::MessageType;
use crate::types::ConnectionId;
use tokio::sync::broadcast;

/// Events published by the protocol layer.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// An envelope was delivered and acknowledged.
    MessageAcked {
        /// Envelope id.
        id: String,
        /// Round-trip time from first send to ack.
        ack_latency_ms: u64,
    },
    /// Delivery failed after the retransmission budget.
    MessageFailed {
        /// Envelope id.
        id: String,
        /// Connection the message was bound to.
        connection_id: ConnectionId,
        /// Retransmissions attempted.
        retries: u32,
    },
    /// A duplicate envelope id was suppressed.
    DuplicateSuppressed {
        /// Envelope id.
        id: String,
        /// Connection the duplicate arrived on.
        connection_id: ConnectionId,
    },
    /// A valid message had no registered handler.
    UnhandledMessage {
        /// Message type with no handler.
        message_type: MessageType,
        /// Connection the message arrived on.
        connection_id: ConnectionId,
    },
    /// An envelope failed validation and was dropped.
    InvalidMessage {
        /// Taxonomy kind wire name.
        kind: &'static str,
        /// Connection the message arrived on.
        connection_id: ConnectionId,
    },
}

/// Broadcast bus for [`ProtocolEvent`]s.
///
/// Cheap to clone; each subscriber gets an independent cursor. Slow
/// subscribers may observe `Lagged` per tokio broadcast semantics.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProtocolEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Lack of subscribers is not an error.
    pub fn publish(&self, event: ProtocolEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ProtocolEvent::MessageAcked {
            id: "m-1".into(),
            ack_latency_ms: 12,
        });
        match rx.recv().await.unwrap() {
            ProtocolEvent::MessageAcked { id, ack_latency_ms } => {
                assert_eq!(id, "m-1");
                assert_eq!(ack_latency_ms, 12);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(ProtocolEvent::DuplicateSuppressed {
            id: "m-2".into(),
            connection_id: "conn-1".into(),
        });
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(ProtocolEvent::UnhandledMessage {
            message_type: MessageType::Metrics,
            connection_id: "conn-9".into(),
        });
        assert!(matches!(
            a.recv().await.unwrap(),
            ProtocolEvent::UnhandledMessage { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            ProtocolEvent::UnhandledMessage { .. }
        ));
    }
}
