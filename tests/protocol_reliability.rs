//! Envelope and reliability-layer behavior across the wire boundary:
//! duplicate suppression, ack round-trips, and codec properties.

use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vigil_core::envelope::{
    AudioChunkPayload, Envelope, HeartbeatPayload, MessagePayload, MessageType, Priority,
    TranscriptPayload,
};
use vigil_core::events::{EventBus, ProtocolEvent};
use vigil_core::registry::{FnHandler, HandlerOutcome, HandlerRegistry};
use vigil_core::reliability::{ReliabilityConfig, ReliabilityLayer, SendFn, SendFuture};
use vigil_core::types::{AudioEncoding, ConnectionId, now_ms};

fn null_send() -> SendFn {
    Arc::new(|_frame: String| Box::pin(async { Ok(()) }) as SendFuture)
}

fn layer(ack_timeout_ms: u64, max_retries: u32) -> ReliabilityLayer {
    ReliabilityLayer::new(
        ReliabilityConfig {
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            max_retries,
            dedup_window: 64,
            compression_threshold: 8 * 1024,
        },
        EventBus::default(),
    )
}

fn counting_registry() -> (HandlerRegistry, Arc<AtomicUsize>) {
    let registry = HandlerRegistry::new(EventBus::default());
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = Arc::clone(&count);
    registry.register(
        MessageType::Heartbeat,
        Arc::new(FnHandler(move |_: &Envelope, _: &ConnectionId| {
            count_clone.fetch_add(1, Ordering::Relaxed);
            HandlerOutcome::handled()
        })),
    );
    (registry, count)
}

fn heartbeat() -> Envelope {
    Envelope::new(
        MessagePayload::Heartbeat(HeartbeatPayload { sent_at: now_ms() }),
        "peer",
    )
}

#[tokio::test]
async fn duplicate_envelope_dispatches_once() {
    let layer = layer(5_000, 3);
    let (registry, count) = counting_registry();
    let conn = "conn-1".to_string();
    let frame = heartbeat().encode().unwrap();

    let first = layer
        .receive(&frame, &conn, null_send(), &registry)
        .await
        .unwrap();
    assert!(first.is_some());
    let second = layer
        .receive(&frame, &conn, null_send(), &registry)
        .await
        .unwrap();
    assert!(second.is_none());

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(layer.stats().duplicates_detected, 1);
}

#[tokio::test]
async fn ack_round_trip_resolves_within_budget() {
    // Sender and receiver wired back to back: sender frames land at the
    // receiver, whose acks land back at the sender.
    let sender = Arc::new(layer(5_000, 3));

    let (receiver_tx, mut receiver_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let to_receiver: SendFn = Arc::new(move |frame: String| {
        let tx = receiver_tx.clone();
        Box::pin(async move {
            let _ = tx.send(frame);
            Ok(())
        }) as SendFuture
    });

    let envelope = heartbeat().with_ack_required();
    sender
        .send(envelope, &"conn-a".to_string(), to_receiver)
        .await
        .unwrap();
    assert_eq!(sender.pending_count(), 1);

    // Receiver validates and acks; route the ack back into the sender.
    let receiver = layer(5_000, 3);
    let (registry, _) = counting_registry();
    let frame = receiver_rx.recv().await.unwrap();
    let (ack_tx, mut ack_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let ack_path: SendFn = Arc::new(move |frame: String| {
        let tx = ack_tx.clone();
        Box::pin(async move {
            let _ = tx.send(frame);
            Ok(())
        }) as SendFuture
    });
    receiver
        .receive(&frame, &"conn-b".to_string(), ack_path, &registry)
        .await
        .unwrap();

    let ack_frame = ack_rx.recv().await.unwrap();
    sender
        .receive(&ack_frame, &"conn-a".to_string(), null_send(), &registry)
        .await
        .unwrap();

    assert_eq!(sender.pending_count(), 0);
    assert_eq!(sender.stats().acks_received, 1);
}

#[tokio::test]
async fn unacked_message_fails_exactly_once() {
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let layer = ReliabilityLayer::new(
        ReliabilityConfig {
            ack_timeout: Duration::from_millis(20),
            max_retries: 2,
            dedup_window: 64,
            compression_threshold: 8 * 1024,
        },
        bus,
    );

    layer
        .send(
            heartbeat().with_priority(Priority::Urgent),
            &"conn-1".to_string(),
            null_send(),
        )
        .await
        .unwrap();

    // Exactly one failure event after the retry budget.
    let mut failures = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(ProtocolEvent::MessageFailed { retries, .. })) => {
                failures += 1;
                assert_eq!(retries, 2);
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert_eq!(failures, 1);
    assert_eq!(layer.stats().retransmissions, 2);
    assert_eq!(layer.stats().delivery_failures, 1);
}

#[tokio::test]
async fn retransmitted_frame_is_suppressed_by_receiver() {
    let layer = layer(5_000, 3);
    let (registry, count) = counting_registry();
    let conn = "conn-1".to_string();

    let mut envelope = heartbeat().with_ack_required();
    let frame = envelope.encode().unwrap();
    // A retransmission carries the retry count but the same id.
    envelope.retry = 1;
    let retransmit = envelope.encode().unwrap();

    layer
        .receive(&frame, &conn, null_send(), &registry)
        .await
        .unwrap();
    layer
        .receive(&retransmit, &conn, null_send(), &registry)
        .await
        .unwrap();

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(layer.stats().duplicates_detected, 1);
}

#[test]
fn envelope_checksum_is_stable_across_reserialization() {
    let envelope = Envelope::new(
        MessagePayload::Transcript(TranscriptPayload {
            call_id: "call-1".into(),
            chunk_id: "chunk-1".into(),
            text: "测试".into(),
            confidence: 0.7,
        }),
        "pipeline",
    );
    let first = envelope.encode().unwrap();
    let second = Envelope::decode(&first).unwrap().encode().unwrap();
    assert_eq!(first, second);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_envelope_round_trips(
        text in "[a-zA-Z0-9\u{4e00}-\u{4fff} ]{0,80}",
        confidence in 0.0f64..=1.0,
        sequence in proptest::option::of(any::<u64>()),
    ) {
        let mut envelope = Envelope::new(
            MessagePayload::Transcript(TranscriptPayload {
                call_id: "call-p".into(),
                chunk_id: "chunk-p".into(),
                text,
                confidence,
            }),
            "pipeline",
        );
        envelope.sequence_number = sequence;
        let frame = envelope.encode().unwrap();
        let decoded = Envelope::decode(&frame).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn prop_audio_payload_round_trips(payload in proptest::collection::vec(any::<u8>(), 1..4096)) {
        let envelope = Envelope::new(
            MessagePayload::AudioChunk(AudioChunkPayload {
                id: "chunk-p".into(),
                call_id: "call-p".into(),
                sequence_number: 3,
                timestamp: 1_700_000_000_000,
                sample_rate: 16_000,
                channels: 1,
                encoding: AudioEncoding::Pcm,
                audio_data: payload,
            }),
            "gateway",
        );
        let frame = envelope.encode().unwrap();
        let decoded = Envelope::decode(&frame).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn prop_tampered_payload_is_rejected(flip in 0usize..64) {
        let envelope = Envelope::new(
            MessagePayload::Transcript(TranscriptPayload {
                call_id: "call-p".into(),
                chunk_id: "chunk-p".into(),
                text: "abcdefghijklmnopqrstuvwxyz0123456789".into(),
                confidence: 0.5,
            }),
            "pipeline",
        );
        let frame = envelope.encode().unwrap();
        // Flip one character inside the transcript body.
        let needle = "abcdefghijklmnopqrstuvwxyz0123456789";
        let start = frame.find(needle).unwrap();
        let index = start + (flip % needle.len());
        let mut bytes = frame.into_bytes();
        bytes[index] = if bytes[index] == b'x' { b'y' } else { b'x' };
        let tampered = String::from_utf8(bytes).unwrap();
        if tampered.contains(needle) {
            // Flip landed on the same character; skip.
            return Ok(());
        }
        prop_assert!(Envelope::decode(&tampered).is_err());
    }
}
