//! Signaling endpoint.
//!
//! A dedicated WebSocket listener whose frames are raw signaling JSON
//! (`join-room`, `leave-room`, `offer`, `answer`, `ice-candidate`). Each
//! connection is one peer: the first frame must be `join-room` carrying
//! `userId` and `callId` in `data`; the join acknowledgement echoes the
//! `join-room` type back with the assigned peer id and the current peer
//! list. Hub notifications and forwarded messages flow out over the same
//! socket. Closing the socket leaves the room.

use std::sync::Arc;
use tokio::sync::mpsc;
use vigil_signal::hub::SignalingHub;
use vigil_signal::messages::{ForwardKind, SignalMessage, SignalMessageType};
use vigil_transport::reliable::ReliableTransport;
use vigil_transport::transport::Transport;

/// Drive one signaling peer until its socket closes.
pub async fn handle_signal_connection(hub: Arc<SignalingHub>, transport: ReliableTransport) {
    let transport = Arc::new(transport);

    // First frame: join-room.
    let first = match transport.recv().await {
        Ok(frame) => frame,
        Err(_) => return,
    };
    let Ok(join) = serde_json::from_str::<SignalMessage>(&first) else {
        tracing::debug!("malformed signaling frame; closing");
        let _ = transport.close().await;
        return;
    };
    if join.message_type != SignalMessageType::JoinRoom {
        tracing::debug!("first signaling frame must be join-room");
        let _ = transport.close().await;
        return;
    }
    let user_id = join.data["userId"].as_str().unwrap_or("anonymous").to_string();
    let call_id = join.data["callId"].as_str().unwrap_or(&join.room_id).to_string();

    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
    let ack = match hub.join(&user_id, &call_id, &join.room_id, tx) {
        Ok(ack) => ack,
        Err(e) => {
            tracing::info!("join rejected for {user_id}: {e}");
            let _ = transport.close().await;
            return;
        }
    };
    let peer_id = ack.peer_id.clone();

    // Join acknowledgement: assigned peer id plus the current peer list.
    let ack_message = SignalMessage::notification(
        SignalMessageType::JoinRoom,
        &join.room_id,
        &peer_id,
        serde_json::json!({
            "peers": ack.peers,
            "isInitiator": ack.is_initiator,
        }),
    );
    if send_message(&transport, &ack_message).await.is_err() {
        let _ = hub.leave(&peer_id);
        return;
    }

    // Outbound pump: hub notifications and forwarded messages.
    let writer = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if send_message(&transport, &message).await.is_err() {
                    break;
                }
            }
        })
    };

    // Inbound loop.
    while let Ok(frame) = transport.recv().await {
        let Ok(message) = serde_json::from_str::<SignalMessage>(&frame) else {
            tracing::debug!("malformed frame from peer {peer_id}");
            continue;
        };
        hub.touch(&peer_id);
        match message.message_type {
            SignalMessageType::LeaveRoom => break,
            SignalMessageType::Offer | SignalMessageType::Answer | SignalMessageType::IceCandidate => {
                let kind = match message.message_type {
                    SignalMessageType::Offer => ForwardKind::Offer,
                    SignalMessageType::Answer => ForwardKind::Answer,
                    _ => ForwardKind::IceCandidate,
                };
                let Some(target) = message.target_peer_id.as_deref() else {
                    tracing::debug!("forward without target from {peer_id}");
                    continue;
                };
                if let Err(e) = hub.forward(&peer_id, target, kind, message.data) {
                    tracing::debug!("forward failed from {peer_id}: {e}");
                }
            }
            // join-room twice and hub notification types are ignored.
            _ => {}
        }
    }

    let _ = hub.leave(&peer_id);
    writer.abort();
    let _ = transport.close().await;
    tracing::debug!("signaling peer {peer_id} disconnected");
}

async fn send_message(
    transport: &Arc<ReliableTransport>,
    message: &SignalMessage,
) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(message) else {
        return Err(());
    };
    transport.send(&json).await.map_err(|_| ())
}
