//! Signaling hub scenarios across multiple peers: membership fan-out,
//! initiator hand-over, and targeted forwarding under churn.

use tokio::sync::mpsc;
use vigil_core::config::SignalConfig;
use vigil_signal::hub::{JoinAck, SignalingHub};
use vigil_signal::messages::{ForwardKind, SignalMessage, SignalMessageType};

fn hub() -> SignalingHub {
    SignalingHub::new(SignalConfig {
        max_peers_per_room: 4,
        max_rooms_per_user: 2,
        ..Default::default()
    })
}

fn join(
    hub: &SignalingHub,
    user: &str,
    room: &str,
) -> (JoinAck, mpsc::UnboundedReceiver<SignalMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let ack = hub.join(user, "call-1", room, tx).unwrap();
    (ack, rx)
}

#[tokio::test]
async fn three_peer_negotiation_flow() {
    let hub = hub();
    let (a, mut rx_a) = join(&hub, "user-a", "room-1");
    let (b, mut rx_b) = join(&hub, "user-b", "room-1");
    let (c, _rx_c) = join(&hub, "user-c", "room-1");

    assert!(a.is_initiator);
    assert!(!b.is_initiator);
    assert_eq!(c.peers, vec![a.peer_id.clone(), b.peer_id.clone()]);

    // a sees joins of b then c, in hub order.
    assert_eq!(rx_a.recv().await.unwrap().peer_id, b.peer_id);
    assert_eq!(rx_a.recv().await.unwrap().peer_id, c.peer_id);

    // Offer from the initiator reaches only its target.
    hub.forward(
        &a.peer_id,
        &b.peer_id,
        ForwardKind::Offer,
        serde_json::json!({"sdp": "v=0 offer"}),
    )
    .unwrap();
    let offer = rx_b.recv().await.unwrap();
    assert_eq!(offer.message_type, SignalMessageType::Offer);
    assert_eq!(offer.peer_id, a.peer_id);
    assert_eq!(offer.data["sdp"], "v=0 offer");

    // Answer flows back.
    hub.forward(
        &b.peer_id,
        &a.peer_id,
        ForwardKind::Answer,
        serde_json::json!({"sdp": "v=0 answer"}),
    )
    .unwrap();
    let answer = rx_a.recv().await.unwrap();
    assert_eq!(answer.message_type, SignalMessageType::Answer);
    assert_eq!(answer.target_peer_id.as_deref(), Some(a.peer_id.as_str()));
}

#[tokio::test]
async fn initiator_leave_promotes_next_oldest() {
    let hub = hub();
    let (a, _rx_a) = join(&hub, "user-a", "room-1");
    let (b, mut rx_b) = join(&hub, "user-b", "room-1");
    let (c, mut rx_c) = join(&hub, "user-c", "room-1");
    // Drain join notifications.
    let _ = rx_b.recv().await;
    let _ = rx_c.try_recv();

    hub.leave(&a.peer_id).unwrap();

    let left = rx_b.recv().await.unwrap();
    assert_eq!(left.message_type, SignalMessageType::PeerLeft);
    assert_eq!(left.data["newInitiator"], b.peer_id.as_str());
    assert!(hub.peer(&b.peer_id).unwrap().is_initiator);
    assert!(!hub.peer(&c.peer_id).unwrap().is_initiator);
}

#[tokio::test]
async fn full_room_and_user_limits() {
    let hub = hub();
    for user in ["u1", "u2", "u3", "u4"] {
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.join(user, "call-1", "room-1", tx).unwrap();
    }
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(hub.join("u5", "call-1", "room-1", tx).is_err());

    // u1 may hold a second room but not a third.
    let (tx, _rx) = mpsc::unbounded_channel();
    hub.join("u1", "call-2", "room-2", tx).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(hub.join("u1", "call-3", "room-3", tx).is_err());
}

#[tokio::test]
async fn empty_rooms_are_cleaned_up() {
    let hub = hub();
    let (a, _rx_a) = join(&hub, "user-a", "room-1");
    assert_eq!(hub.room_count(), 1);

    hub.leave(&a.peer_id).unwrap();
    let deleted = hub.cleanup_pass();
    assert_eq!(deleted, 1);
    assert_eq!(hub.room_count(), 0);

    // Forwarding against the dead room fails cleanly.
    assert!(
        hub.forward(&a.peer_id, "ghost", ForwardKind::IceCandidate, serde_json::Value::Null)
            .is_err()
    );
}
