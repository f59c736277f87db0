//! The per-call pipeline executor.
//!
//! One worker task per call, created on the first chunk and fed through
//! the call's ring buffer. Within a call exactly one chunk executes at a
//! time, lowest sequence number first; across calls workers run freely.
//!
//! Stage instrumentation feeds the latency monitor; emitted chunks feed
//! the performance controller, whose response cache can satisfy a chunk
//! without running the pipeline at all. Stage failures are fatal to the
//! chunk only and follow the degradation policy: recognizer and
//! synthesizer failures return partial results, intent and response
//! failures fall back to the keyword classifier and canned replies.

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::chunk::DecoderRegistry;
use crate::clients::{
    IntentClassifier, PersonalityProfile, ResponseContext, ResponseGenerator, SpeechRecognizer,
    SpeechSynthesizer, VoiceProfile,
};
use crate::context::CallContext;
use crate::dsp::AdaptiveAudioProcessor;
use crate::error::{PipelineError, Result};
use crate::intent::classify_by_keywords;
use crate::respond::ResponsePlanner;
use crate::vad::VoiceActivityDetector;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use vigil_core::config::{BreakerConfig, PipelineConfig};
use vigil_core::types::{AudioChunk, CallId, PipelineResult, QualityMetrics, now_ms};
use vigil_perf::cache::response_cache_key;
use vigil_perf::controller::PerformanceController;
use vigil_perf::monitor::LatencyMonitor;

/// How often (in speech messages) the DSP chain is re-tuned per call.
const DSP_TUNE_EVERY: u32 = 8;

/// The external engines behind the pipeline stages.
#[derive(Clone)]
pub struct StageClients {
    /// Speech-to-text engine.
    pub recognizer: Arc<dyn SpeechRecognizer>,
    /// Intent classification engine.
    pub intent: Arc<dyn IntentClassifier>,
    /// Reply generation engine.
    pub responder: Arc<dyn ResponseGenerator>,
    /// Text-to-speech engine.
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Events published by the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A chunk was dequeued and is being processed.
    ChunkAccepted {
        /// Owning call.
        call_id: CallId,
        /// Chunk id.
        chunk_id: String,
        /// Chunk sequence number.
        sequence_number: u64,
    },
    /// A chunk finished; silence results carry only the latency.
    ChunkCompleted(PipelineResult),
    /// A chunk failed; the pipeline continues with the next chunk.
    ChunkFailed {
        /// Owning call.
        call_id: CallId,
        /// Chunk id.
        chunk_id: String,
        /// Taxonomy kind wire name.
        kind: &'static str,
        /// Failure description.
        message: String,
    },
    /// A chunk was served from the response cache without execution.
    CacheHit {
        /// Owning call.
        call_id: CallId,
        /// Chunk id.
        chunk_id: String,
    },
}

/// Per-dependency circuit breakers.
struct Breakers {
    recognizer: CircuitBreaker,
    intent: CircuitBreaker,
    responder: CircuitBreaker,
    synthesizer: CircuitBreaker,
}

/// Handle to one call's worker.
struct CallWorker {
    queued: Arc<AtomicUsize>,
    notify: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Counter snapshot for the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Chunks fully processed (including silence).
    pub chunks_processed: u64,
    /// Chunks gated off as non-speech.
    pub non_speech_total: u64,
    /// Chunks that failed.
    pub chunk_errors: u64,
    /// Chunks served from the response cache.
    pub cache_hits: u64,
}

/// The audio transform pipeline.
pub struct AudioPipeline {
    config: PipelineConfig,
    clients: StageClients,
    breakers: Arc<Breakers>,
    dsp: Arc<AdaptiveAudioProcessor>,
    decoders: Arc<DecoderRegistry>,
    controller: Arc<PerformanceController>,
    monitor: Arc<LatencyMonitor>,
    planner: ResponsePlanner,
    calls: DashMap<CallId, CallWorker>,
    profiles: DashMap<CallId, (PersonalityProfile, VoiceProfile)>,
    events: broadcast::Sender<PipelineEvent>,
    chunks_processed: Arc<AtomicU64>,
    non_speech_total: Arc<AtomicU64>,
    chunk_errors: Arc<AtomicU64>,
    cache_hits: Arc<AtomicU64>,
}

impl AudioPipeline {
    /// Create a pipeline wired to its engines and observers.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        breaker_config: BreakerConfig,
        clients: StageClients,
        controller: Arc<PerformanceController>,
        monitor: Arc<LatencyMonitor>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let planner = ResponsePlanner::from_config(&config);
        Arc::new(Self {
            breakers: Arc::new(Breakers {
                recognizer: CircuitBreaker::new("recognizer", breaker_config.clone()),
                intent: CircuitBreaker::new("intent", breaker_config.clone()),
                responder: CircuitBreaker::new("responder", breaker_config.clone()),
                synthesizer: CircuitBreaker::new("synthesizer", breaker_config),
            }),
            dsp: Arc::new(AdaptiveAudioProcessor::new()),
            decoders: Arc::new(DecoderRegistry::new()),
            planner,
            config,
            clients,
            controller,
            monitor,
            calls: DashMap::new(),
            profiles: DashMap::new(),
            events,
            chunks_processed: Arc::new(AtomicU64::new(0)),
            non_speech_total: Arc::new(AtomicU64::new(0)),
            chunk_errors: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Subscribe to pipeline events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Decoder registry for plugging codec engines.
    #[must_use]
    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    /// Set the reply personality and synthesis voice for a call.
    ///
    /// Effective for workers created after this point; typically called
    /// when the session opens, before the first chunk.
    pub fn set_profiles(&self, call_id: &str, personality: PersonalityProfile, voice: VoiceProfile) {
        self.profiles
            .insert(call_id.to_string(), (personality, voice));
    }

    /// Submit a chunk for its call.
    ///
    /// Creates the call's worker on first use. Applies admission
    /// backpressure when the call's ring is saturated; rejects outright
    /// when the queue is full.
    ///
    /// # Errors
    /// Returns [`PipelineError::Backpressure`] at queue capacity.
    pub async fn submit(self: &Arc<Self>, chunk: AudioChunk) -> Result<()> {
        let call_id = chunk.call_id.clone();
        let (queued, notify) = {
            let worker = self
                .calls
                .entry(call_id.clone())
                .or_insert_with(|| self.spawn_worker(&call_id));
            (Arc::clone(&worker.queued), Arc::clone(&worker.notify))
        };

        if queued.load(Ordering::Relaxed) >= self.config.max_queue_size {
            self.chunk_errors.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::Backpressure(call_id));
        }

        self.controller.admission_delay(&call_id).await;
        queued.fetch_add(1, Ordering::Relaxed);
        if self.controller.buffer_chunk(chunk).is_some() {
            // The ring displaced its oldest chunk; it will never process.
            queued.fetch_sub(1, Ordering::Relaxed);
        }
        notify.notify_one();
        Ok(())
    }

    /// Spawn the single worker for a call.
    fn spawn_worker(self: &Arc<Self>, call_id: &str) -> CallWorker {
        let queued = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        self.controller.register_call(call_id);

        let pipeline = Arc::clone(self);
        let call_id = call_id.to_string();
        let worker_queued = Arc::clone(&queued);
        let worker_notify = Arc::clone(&notify);
        let worker_call_id = call_id.clone();
        let task = tokio::spawn(async move {
            let call_id = worker_call_id;
            let ring = match pipeline.controller.ring(&call_id) {
                Some(ring) => ring,
                None => return,
            };
            let mut context = CallContext::new(&call_id, pipeline.config.context_window);
            if let Some(profiles) = pipeline.profiles.get(&call_id) {
                context.personality = profiles.0.clone();
                context.voice = profiles.1.clone();
            }
            let mut vad = VoiceActivityDetector::new(
                pipeline.config.vad_base_threshold,
                pipeline.config.vad_hangover_chunks,
            );
            let mut reorder: BTreeMap<u64, AudioChunk> = BTreeMap::new();

            loop {
                while let Some(chunk) = ring.pop() {
                    reorder.insert(chunk.sequence_number, chunk);
                }
                match reorder.pop_first() {
                    Some((_, chunk)) => {
                        pipeline.process_chunk(chunk, &mut context, &mut vad).await;
                        worker_queued.fetch_sub(1, Ordering::Relaxed);
                    }
                    None => worker_notify.notified().await,
                }
            }
        });

        tracing::debug!("worker spawned for call {call_id}");
        CallWorker {
            queued,
            notify,
            task,
        }
    }

    fn publish(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn fail_chunk(&self, call_id: &str, chunk_id: &str, error: &PipelineError) {
        self.chunk_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("chunk {chunk_id} on {call_id} failed: {error}");
        self.publish(PipelineEvent::ChunkFailed {
            call_id: call_id.to_string(),
            chunk_id: chunk_id.to_string(),
            kind: error.kind().as_str(),
            message: error.to_string(),
        });
    }

    /// Run one chunk through the six stages.
    async fn process_chunk(
        self: &Arc<Self>,
        chunk: AudioChunk,
        context: &mut CallContext,
        vad: &mut VoiceActivityDetector,
    ) {
        let started = Instant::now();
        let call_id = chunk.call_id.clone();
        let chunk_id = chunk.id.clone();
        self.publish(PipelineEvent::ChunkAccepted {
            call_id: call_id.clone(),
            chunk_id: chunk_id.clone(),
            sequence_number: chunk.sequence_number,
        });

        // Cache short-circuit: identical audio within the call.
        let cache_key = response_cache_key(
            &call_id,
            &chunk.payload,
            chunk.sample_rate,
            chunk.channel_count,
        );
        if let Some(mut cached) = self.controller.cached_response(&cache_key) {
            cached.chunk_id = chunk_id.clone();
            cached.timestamp = now_ms();
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.chunks_processed.fetch_add(1, Ordering::Relaxed);
            self.publish(PipelineEvent::CacheHit {
                call_id: call_id.clone(),
                chunk_id,
            });
            self.publish(PipelineEvent::ChunkCompleted(cached));
            return;
        }

        // Stage 1: preprocess (decode, validate, DSP).
        let stage = Instant::now();
        let max_payload = self.config.chunk_size_bytes * 10;
        let mut samples = match self.decoders.decode_chunk(&chunk, max_payload) {
            Ok(samples) => samples,
            Err(e) => {
                self.fail_chunk(&call_id, &chunk_id, &e);
                return;
            }
        };
        let quality = self
            .dsp
            .process(&call_id, &mut samples, chunk.sample_rate);
        self.monitor
            .record_stage("preprocess", stage.elapsed().as_millis() as u64);

        // Stage 2: speech gate.
        let stage = Instant::now();
        let decision = vad.detect(&samples, chunk.sample_rate);
        self.monitor
            .record_stage("vad", stage.elapsed().as_millis() as u64);
        if !decision.is_speech {
            self.non_speech_total.fetch_add(1, Ordering::Relaxed);
            self.finish_silence(&call_id, &chunk_id, started, quality);
            return;
        }

        // Stage 3: recognize. Failures degrade to a silence-like result.
        let stage = Instant::now();
        let recognition = self
            .breakers
            .recognizer
            .call(self.clients.recognizer.recognize(&samples, chunk.sample_rate))
            .await;
        self.monitor
            .record_stage("recognize", stage.elapsed().as_millis() as u64);
        let recognition = match recognition {
            Ok(recognition) => recognition,
            Err(e) => {
                tracing::debug!("recognizer degraded for {chunk_id}: {e}");
                self.finish_silence(&call_id, &chunk_id, started, quality);
                return;
            }
        };
        if recognition.text.trim().is_empty() {
            self.finish_silence(&call_id, &chunk_id, started, quality);
            return;
        }
        context.record_transcript(&recognition.text);

        // Stage 4: classify intent; keyword fallback on failure.
        let stage = Instant::now();
        let intent_result = self
            .breakers
            .intent
            .call(
                self.clients
                    .intent
                    .classify(&recognition.text, &context.intent_context()),
            )
            .await;
        self.monitor
            .record_stage("intent", stage.elapsed().as_millis() as u64);
        let intent = match intent_result {
            Ok(intent) => intent,
            Err(e) => {
                tracing::debug!("intent fallback for {chunk_id}: {e}");
                classify_by_keywords(&recognition.text)
            }
        };
        context.record_intent(intent.clone());

        // Stage 5: generate response; canned fallback on failure.
        let stage = Instant::now();
        let strategy = self.planner.select_strategy(
            context.message_count,
            context.duration_ms(),
            intent.emotional_tone,
        );
        let response_context = ResponseContext {
            recent_transcripts: context.recent_transcripts.iter().cloned().collect(),
            message_count: context.message_count,
            call_duration_ms: context.duration_ms(),
            personality: context.personality.clone(),
            strategy,
        };
        let generated = self
            .breakers
            .responder
            .call(self.clients.responder.generate(&intent, &response_context))
            .await
            .ok();
        let mut response =
            self.planner
                .build_response(strategy, generated, &context.personality);
        self.monitor
            .record_stage("respond", stage.elapsed().as_millis() as u64);

        // Stage 6: synthesize; the response survives without audio.
        let stage = Instant::now();
        let synthesis = self
            .breakers
            .synthesizer
            .call(self.clients.synthesizer.synthesize(&response.text, &context.voice))
            .await;
        self.monitor
            .record_stage("synthesize", stage.elapsed().as_millis() as u64);
        match synthesis {
            Ok(audio) => response.response_audio = Some(audio),
            Err(e) => tracing::debug!("synthesis degraded for {chunk_id}: {e}"),
        }

        // Emission and feedback.
        let latency_ms = started.elapsed().as_millis() as u64;
        let result = PipelineResult {
            chunk_id: chunk_id.clone(),
            call_id: call_id.clone(),
            timestamp: now_ms(),
            processing_latency_ms: latency_ms,
            transcript: Some(recognition.text),
            intent: Some(intent),
            response: Some(response),
            quality_metrics: quality,
        };
        self.controller
            .record_chunk(&call_id, latency_ms, quality.quality_score);
        self.controller.store_result(&cache_key, &result);
        self.retune_dsp(context, quality.quality_score);
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.publish(PipelineEvent::ChunkCompleted(result));
    }

    /// Emit the canonical latency-only silence result.
    fn finish_silence(
        &self,
        call_id: &str,
        chunk_id: &str,
        started: Instant,
        quality: QualityMetrics,
    ) {
        let latency_ms = started.elapsed().as_millis() as u64;
        let mut result = PipelineResult::silence(chunk_id, call_id, latency_ms);
        result.quality_metrics = quality;
        self.controller
            .record_chunk(call_id, latency_ms, quality.quality_score);
        self.chunks_processed.fetch_add(1, Ordering::Relaxed);
        self.publish(PipelineEvent::ChunkCompleted(result));
    }

    /// Periodically re-tune the DSP chain from observed behavior.
    fn retune_dsp(&self, context: &CallContext, quality: f64) {
        if context.message_count == 0 || context.message_count % DSP_TUNE_EVERY != 0 {
            return;
        }
        let Some(rolling) = self.controller.rolling_latency(&context.call_id) else {
            return;
        };
        let target = self
            .controller
            .tier(&context.call_id)
            .map_or(1_000.0, |tier| tier.latency_target_ms as f64);
        self.dsp
            .optimize_for_call(&context.call_id, rolling, target, quality, 0.5);
    }

    /// Cancel a call: abort its worker, drop queued chunks and state.
    ///
    /// In-flight results are dropped, not emitted.
    pub fn cancel_call(&self, call_id: &str) {
        if let Some((_, worker)) = self.calls.remove(call_id) {
            worker.task.abort();
        }
        self.controller.remove_call(call_id);
        self.dsp.remove_call(call_id);
        self.profiles.remove(call_id);
        tracing::debug!("call {call_id} cancelled");
    }

    /// Cancel every call.
    pub fn shutdown(&self) {
        let ids: Vec<CallId> = self.calls.iter().map(|w| w.key().clone()).collect();
        for call_id in ids {
            self.cancel_call(&call_id);
        }
    }

    /// Breaker snapshot for one dependency
    /// (`recognizer|intent|responder|synthesizer`).
    #[must_use]
    pub fn breaker_snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        let breaker = match name {
            "recognizer" => &self.breakers.recognizer,
            "intent" => &self.breakers.intent,
            "responder" => &self.breakers.responder,
            "synthesizer" => &self.breakers.synthesizer,
            _ => return None,
        };
        Some(breaker.snapshot())
    }

    /// Number of live call workers.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            chunks_processed: self.chunks_processed.load(Ordering::Relaxed),
            non_speech_total: self.non_speech_total.load(Ordering::Relaxed),
            chunk_errors: self.chunk_errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientError, ClientResult, Recognition};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use vigil_core::config::PerformanceConfig;
    use vigil_core::types::{AudioEncoding, IntentCategory, ResponseStrategy};

    /// Recognizer returning a fixed transcript, counting invocations.
    struct FixedRecognizer {
        text: String,
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl SpeechRecognizer for FixedRecognizer {
        async fn recognize(&self, _: &[f32], _: u32) -> ClientResult<Recognition> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(ClientError::new("recognizer", "offline"));
            }
            Ok(Recognition {
                text: self.text.clone(),
                confidence: 0.9,
            })
        }
    }

    /// Intent engine that always fails, forcing the keyword fallback.
    struct FailingIntent;

    #[async_trait]
    impl IntentClassifier for FailingIntent {
        async fn classify(
            &self,
            _: &str,
            _: &crate::clients::IntentContext,
        ) -> ClientResult<vigil_core::types::Intent> {
            Err(ClientError::new("intent", "offline"))
        }
    }

    /// Generator echoing the strategy it was asked to phrase.
    struct TemplateResponder;

    #[async_trait]
    impl ResponseGenerator for TemplateResponder {
        async fn generate(
            &self,
            _: &vigil_core::types::Intent,
            context: &ResponseContext,
        ) -> ClientResult<String> {
            Ok(match context.strategy {
                ResponseStrategy::PoliteDecline => "不好意思，我们不需要，谢谢。".to_string(),
                ResponseStrategy::FirmRejection => "不需要，请不要再打了。".to_string(),
                _ => "请不要再打这个电话了。".to_string(),
            })
        }
    }

    /// Synthesizer producing a tiny marker payload.
    struct MarkerSynth {
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for MarkerSynth {
        async fn synthesize(&self, _: &str, _: &VoiceProfile) -> ClientResult<Vec<u8>> {
            if self.fail {
                return Err(ClientError::new("synthesizer", "offline"));
            }
            Ok(vec![0xAB, 0xCD])
        }
    }

    fn clients(recognizer_text: &str, recognizer_fail: bool, synth_fail: bool) -> StageClients {
        StageClients {
            recognizer: Arc::new(FixedRecognizer {
                text: recognizer_text.to_string(),
                calls: AtomicU32::new(0),
                fail: recognizer_fail,
            }),
            intent: Arc::new(FailingIntent),
            responder: Arc::new(TemplateResponder),
            synthesizer: Arc::new(MarkerSynth { fail: synth_fail }),
        }
    }

    fn pipeline(clients: StageClients) -> Arc<AudioPipeline> {
        let controller = Arc::new(PerformanceController::new(PerformanceConfig {
            cache_ttl_ms: 60_000,
            ..Default::default()
        }));
        let monitor = Arc::new(LatencyMonitor::new(Default::default()));
        AudioPipeline::new(
            PipelineConfig::default(),
            BreakerConfig {
                volume_threshold: 10,
                error_threshold_percent: 50.0,
                reset_timeout_ms: 60_000,
                half_open_max_calls: 3,
                window_size: 64,
                call_timeout_ms: 2_000,
            },
            clients,
            controller,
            monitor,
        )
    }

    fn pcm_bytes(amplitude: f64, len: usize) -> Vec<u8> {
        (0..len)
            .flat_map(|i| {
                let t = i as f64 / 16_000.0;
                let v = amplitude * (2.0 * std::f64::consts::PI * 300.0 * t).sin();
                ((v * 32767.0) as i16).to_le_bytes()
            })
            .collect()
    }

    fn chunk(call: &str, seq: u64, payload: Vec<u8>) -> AudioChunk {
        AudioChunk {
            id: format!("{call}-chunk-{seq}"),
            call_id: call.to_string(),
            timestamp: now_ms(),
            sequence_number: seq,
            payload,
            sample_rate: 16_000,
            channel_count: 1,
            encoding: AudioEncoding::Pcm,
        }
    }

    async fn next_completed(
        events: &mut broadcast::Receiver<PipelineEvent>,
    ) -> PipelineResult {
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
                .await
                .expect("pipeline event timeout")
                .unwrap();
            if let PipelineEvent::ChunkCompleted(result) = event {
                return result;
            }
        }
    }

    #[tokio::test]
    async fn test_silence_short_circuit() {
        let pipeline = pipeline(clients("ignored", false, false));
        let mut events = pipeline.subscribe();

        // 4096 zero samples of 16 kHz mono PCM.
        pipeline
            .submit(chunk("c1", 1, vec![0u8; 8192]))
            .await
            .unwrap();

        let result = next_completed(&mut events).await;
        assert!(result.is_silence());
        assert!(result.transcript.is_none());
        assert!(result.response.is_none());
        assert_eq!(pipeline.stats().non_speech_total, 1);
    }

    #[tokio::test]
    async fn test_happy_path_sales_call() {
        let pipeline = pipeline(clients("推销电话", false, false));
        let mut events = pipeline.subscribe();

        pipeline
            .submit(chunk("c2", 1, pcm_bytes(0.5, 4096)))
            .await
            .unwrap();

        let result = next_completed(&mut events).await;
        assert_eq!(result.transcript.as_deref(), Some("推销电话"));
        let intent = result.intent.unwrap();
        assert_eq!(intent.category, IntentCategory::SalesCall);
        let response = result.response.unwrap();
        assert_eq!(response.strategy, ResponseStrategy::PoliteDecline);
        assert!(!response.should_terminate);
        assert!(response.text.chars().count() <= 50);
        assert_eq!(response.response_audio.as_deref(), Some(&[0xAB, 0xCD][..]));
    }

    #[tokio::test]
    async fn test_accepted_precedes_completed() {
        let pipeline = pipeline(clients("你好", false, false));
        let mut events = pipeline.subscribe();
        pipeline
            .submit(chunk("c3", 1, pcm_bytes(0.5, 4096)))
            .await
            .unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, PipelineEvent::ChunkAccepted { .. }));
        let _ = next_completed(&mut events).await;
    }

    #[tokio::test]
    async fn test_persistence_escalation() {
        let pipeline = pipeline(clients("推销电话", false, false));
        let mut events = pipeline.subscribe();

        let mut strategies = Vec::new();
        for seq in 1..=5u64 {
            // Vary the payload so the response cache never hits.
            let mut payload = pcm_bytes(0.5, 4096);
            payload[0] = seq as u8;
            pipeline.submit(chunk("c4", seq, payload)).await.unwrap();
            let result = next_completed(&mut events).await;
            let response = result.response.unwrap();
            strategies.push(response.strategy);
            if seq == 5 {
                assert!(response.should_terminate);
            }
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
    }

    #[tokio::test]
    async fn test_results_emitted_in_sequence_order() {
        let pipeline = pipeline(clients("继续说", false, false));
        let mut events = pipeline.subscribe();

        for seq in 1..=6u64 {
            let mut payload = pcm_bytes(0.4, 2048);
            payload[1] = seq as u8;
            pipeline.submit(chunk("c5", seq, payload)).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..6 {
            let result = next_completed(&mut events).await;
            let seq: u64 = result
                .chunk_id
                .rsplit('-')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            seen.push(seq);
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_recognizer_failure_degrades_softly() {
        let pipeline = pipeline(clients("", true, false));
        let mut events = pipeline.subscribe();
        pipeline
            .submit(chunk("c6", 1, pcm_bytes(0.5, 4096)))
            .await
            .unwrap();
        let result = next_completed(&mut events).await;
        assert!(result.is_silence());
        assert_eq!(pipeline.stats().chunk_errors, 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_sustained_failures() {
        let pipeline = pipeline(clients("", true, false));
        let mut events = pipeline.subscribe();

        for seq in 1..=11u64 {
            let mut payload = pcm_bytes(0.5, 2048);
            payload[2] = seq as u8;
            pipeline.submit(chunk("c7", seq, payload)).await.unwrap();
            let result = next_completed(&mut events).await;
            assert!(result.is_silence());
        }
        let snapshot = pipeline.breaker_snapshot("recognizer").unwrap();
        assert_eq!(snapshot.state, crate::breaker::BreakerState::Open);
        // The 11th call short-circuited without reaching the engine.
        assert!(snapshot.short_circuited >= 1);
        assert_eq!(snapshot.total_calls, 10);
    }

    #[tokio::test]
    async fn test_synth_failure_keeps_response() {
        let pipeline = pipeline(clients("推销电话", false, true));
        let mut events = pipeline.subscribe();
        pipeline
            .submit(chunk("c8", 1, pcm_bytes(0.5, 4096)))
            .await
            .unwrap();
        let result = next_completed(&mut events).await;
        let response = result.response.unwrap();
        assert!(response.response_audio.is_none());
        assert!(!response.text.is_empty());
    }

    #[tokio::test]
    async fn test_intent_fallback_on_failure() {
        // FailingIntent always errors; the keyword fallback still
        // classifies and confidence stays low.
        let pipeline = pipeline(clients("我们有贷款产品", false, false));
        let mut events = pipeline.subscribe();
        pipeline
            .submit(chunk("c9", 1, pcm_bytes(0.5, 4096)))
            .await
            .unwrap();
        let result = next_completed(&mut events).await;
        let intent = result.intent.unwrap();
        assert_eq!(intent.category, IntentCategory::LoanOffer);
        assert!(intent.confidence < 0.5);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_engines() {
        let recognizer = Arc::new(FixedRecognizer {
            text: "推销电话".to_string(),
            calls: AtomicU32::new(0),
            fail: false,
        });
        let clients = StageClients {
            recognizer: Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>,
            intent: Arc::new(FailingIntent),
            responder: Arc::new(TemplateResponder),
            synthesizer: Arc::new(MarkerSynth { fail: false }),
        };
        let pipeline = pipeline(clients);
        let mut events = pipeline.subscribe();

        let payload = pcm_bytes(0.5, 4096);
        pipeline
            .submit(chunk("c10", 1, payload.clone()))
            .await
            .unwrap();
        let first = next_completed(&mut events).await;
        assert!(first.transcript.is_some());
        assert_eq!(recognizer.calls.load(Ordering::Relaxed), 1);

        // Identical audio on the same call: served from cache.
        pipeline.submit(chunk("c10", 2, payload)).await.unwrap();
        let second = next_completed(&mut events).await;
        assert_eq!(second.transcript.as_deref(), Some("推销电话"));
        assert_eq!(recognizer.calls.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_invalid_chunk_fails_without_stopping_call() {
        let pipeline = pipeline(clients("你好", false, false));
        let mut events = pipeline.subscribe();

        pipeline.submit(chunk("c11", 1, vec![])).await.unwrap();
        let failed = loop {
            let event = events.recv().await.unwrap();
            if let PipelineEvent::ChunkFailed { kind, .. } = event {
                break kind;
            }
        };
        assert_eq!(failed, "validation");

        // The next chunk still processes.
        pipeline
            .submit(chunk("c11", 2, pcm_bytes(0.5, 4096)))
            .await
            .unwrap();
        let result = next_completed(&mut events).await;
        assert!(result.transcript.is_some());
    }

    #[tokio::test]
    async fn test_cancel_call_drops_worker() {
        let pipeline = pipeline(clients("你好", false, false));
        pipeline
            .submit(chunk("c12", 1, pcm_bytes(0.5, 2048)))
            .await
            .unwrap();
        assert_eq!(pipeline.active_calls(), 1);
        pipeline.cancel_call("c12");
        assert_eq!(pipeline.active_calls(), 0);
    }
}
