//! End-to-end pipeline scenarios: silence gating, the spam-call happy
//! path, persistence escalation, and per-call ordering.

use vigil_core::types::{IntentCategory, PipelineResult, ResponseStrategy};
use vigil_integration_tests::{
    ScriptedRecognizer, chunk, silence_pcm, test_breaker, test_pipeline, tone_pcm,
};
use vigil_pipeline::executor::PipelineEvent;

async fn next_completed(
    events: &mut tokio::sync::broadcast::Receiver<PipelineEvent>,
) -> PipelineResult {
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("pipeline event timed out")
            .expect("event channel closed");
        if let PipelineEvent::ChunkCompleted(result) = event {
            return result;
        }
    }
}

#[tokio::test]
async fn silence_short_circuits_with_latency_only_result() {
    let (pipeline, _) = test_pipeline(ScriptedRecognizer::returning("ignored"), test_breaker());
    let mut events = pipeline.subscribe();

    // 4096 zero samples of 16 kHz mono PCM.
    pipeline
        .submit(chunk("c1", 1, silence_pcm(4096)))
        .await
        .unwrap();

    let result = next_completed(&mut events).await;
    assert!(result.is_silence());
    assert!(result.transcript.is_none());
    assert!(result.intent.is_none());
    assert!(result.response.is_none());
    assert_eq!(pipeline.stats().non_speech_total, 1);
}

#[tokio::test]
async fn spam_speech_produces_transcript_and_polite_decline() {
    let (pipeline, _) = test_pipeline(ScriptedRecognizer::returning("推销电话"), test_breaker());
    let mut events = pipeline.subscribe();

    pipeline
        .submit(chunk("c2", 1, tone_pcm(0.5, 4096)))
        .await
        .unwrap();

    // Accepted status precedes the completed result.
    let first = events.recv().await.unwrap();
    assert!(matches!(first, PipelineEvent::ChunkAccepted { .. }));

    let result = next_completed(&mut events).await;
    assert_eq!(result.transcript.as_deref(), Some("推销电话"));
    let intent = result.intent.expect("intent");
    assert_eq!(intent.category, IntentCategory::SalesCall);
    assert!(intent.confidence >= 0.0);

    let response = result.response.expect("response");
    assert_eq!(response.strategy, ResponseStrategy::PoliteDecline);
    assert!(!response.should_terminate);
    assert!(response.text.chars().count() <= 50);
    assert!(response.response_audio.is_some());
}

#[tokio::test]
async fn persistence_escalates_to_termination() {
    let (pipeline, _) = test_pipeline(ScriptedRecognizer::returning("推销电话"), test_breaker());
    let mut events = pipeline.subscribe();

    let mut strategies = Vec::new();
    let mut final_terminate = false;
    for sequence in 1..=5u64 {
        // Unique payloads keep the response cache out of the way.
        let mut payload = tone_pcm(0.5, 4096);
        payload[0] = sequence as u8;
        pipeline
            .submit(chunk("c3", sequence, payload))
            .await
            .unwrap();
        let result = next_completed(&mut events).await;
        let response = result.response.expect("response");
        strategies.push(response.strategy);
        final_terminate = response.should_terminate;
    }

    assert_eq!(
        strategies,
        vec![
            ResponseStrategy::PoliteDecline,
            ResponseStrategy::PoliteDecline,
            ResponseStrategy::PoliteDecline,
            ResponseStrategy::FirmRejection,
            ResponseStrategy::CallTermination,
        ]
    );
    assert!(final_terminate);
}

#[tokio::test]
async fn results_emit_in_sequence_order() {
    let (pipeline, _) = test_pipeline(ScriptedRecognizer::returning("继续"), test_breaker());
    let mut events = pipeline.subscribe();

    for sequence in 1..=8u64 {
        let mut payload = tone_pcm(0.4, 2048);
        payload[1] = sequence as u8;
        pipeline
            .submit(chunk("c4", sequence, payload))
            .await
            .unwrap();
    }

    let mut observed = Vec::new();
    for _ in 0..8 {
        let result = next_completed(&mut events).await;
        let sequence: u64 = result
            .chunk_id
            .rsplit('-')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        observed.push(sequence);
    }
    let mut sorted = observed.clone();
    sorted.sort_unstable();
    assert_eq!(observed, sorted, "results out of order: {observed:?}");
}

#[tokio::test]
async fn calls_are_isolated_from_each_other() {
    let (pipeline, _) = test_pipeline(ScriptedRecognizer::returning("推销电话"), test_breaker());
    let mut events = pipeline.subscribe();

    // An invalid chunk on one call never disturbs another call.
    pipeline.submit(chunk("bad-call", 1, vec![])).await.unwrap();
    pipeline
        .submit(chunk("good-call", 1, tone_pcm(0.5, 4096)))
        .await
        .unwrap();

    let mut failed_call = None;
    let mut completed_call = None;
    while failed_call.is_none() || completed_call.is_none() {
        match tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PipelineEvent::ChunkFailed { call_id, kind, .. } => {
                assert_eq!(kind, "validation");
                failed_call = Some(call_id);
            }
            PipelineEvent::ChunkCompleted(result) if !result.is_silence() => {
                completed_call = Some(result.call_id);
            }
            _ => {}
        }
    }
    assert_eq!(failed_call.as_deref(), Some("bad-call"));
    assert_eq!(completed_call.as_deref(), Some("good-call"));
}

#[tokio::test]
async fn cancelled_call_emits_nothing_further() {
    let (pipeline, _) = test_pipeline(ScriptedRecognizer::returning("你好"), test_breaker());
    pipeline
        .submit(chunk("c5", 1, tone_pcm(0.5, 2048)))
        .await
        .unwrap();
    assert_eq!(pipeline.active_calls(), 1);

    pipeline.cancel_call("c5");
    assert_eq!(pipeline.active_calls(), 0);

    // A fresh worker accepts chunks for the call again afterwards.
    pipeline
        .submit(chunk("c5", 2, tone_pcm(0.5, 2048)))
        .await
        .unwrap();
    assert_eq!(pipeline.active_calls(), 1);
}
