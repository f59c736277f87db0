//! Component wiring and the main accept loop.
//!
//! The composition root: every component is constructed here, handed its
//! configuration slice, and wired through handlers and event
//! subscriptions. Nothing else in the workspace holds global state.
//!
//! Per connection: frames are received on the reliable transport, run
//! through the reliability layer (validation, dedup, acks), and
//! dispatched by message type. Audio chunks feed the per-call pipeline;
//! pipeline events fan back out as transcript / ai_response /
//! audio_response / processing_status frames to every session observing
//! the call.

use crate::engines::{DevIntentClassifier, DevRecognizer, DevResponder, DevSynthesizer};
use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vigil_core::config::VigilConfig;
use vigil_core::envelope::{
    AiResponsePayload, AudioResponsePayload, Envelope, ErrorPayload, MessagePayload, MessageType,
    ProcessingStatusPayload, TranscriptPayload,
};
use vigil_core::events::EventBus;
use vigil_core::registry::{Handler, HandlerOutcome, HandlerRegistry};
use vigil_core::reliability::{ReliabilityLayer, SendFn, SendFuture};
use vigil_core::types::{AudioEncoding, CallId, ConnectionId, PipelineResult, SessionId};
use vigil_perf::controller::PerformanceController;
use vigil_perf::monitor::LatencyMonitor;
use vigil_pipeline::executor::{AudioPipeline, PipelineEvent, StageClients};
use vigil_pipeline::error::PipelineError;
use vigil_session::AuthSessionManager;
use vigil_signal::hub::SignalingHub;
use vigil_signal::messages::ForwardKind;
use vigil_transport::pool::{AcquireRequest, ConnectionPool, ReleaseReason};
use vigil_transport::reliable::{ReliableListener, ReliableTransport};
use vigil_transport::session::{CallControl, SessionManager};
use vigil_transport::transport::{ChannelKind, Transport};

/// Name stamped as the source of service-originated envelopes.
const SERVICE_SOURCE: &str = "vigil";

/// Grace period for session finalization at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The assembled service.
pub struct App {
    config: VigilConfig,
    registry: Arc<HandlerRegistry>,
    reliability: Arc<ReliabilityLayer>,
    hub: Arc<SignalingHub>,
    sessions: Arc<SessionManager>,
    pool: Arc<ConnectionPool>,
    controller: Arc<PerformanceController>,
    monitor: Arc<LatencyMonitor>,
    pipeline: Arc<AudioPipeline>,
    auth: Arc<AuthSessionManager>,
    /// Live reliable transports by connection.
    transports: Arc<DashMap<ConnectionId, Arc<ReliableTransport>>>,
    /// Session each connection established, for touch and teardown.
    conn_sessions: Arc<DashMap<ConnectionId, SessionId>>,
    /// Connection currently carrying each session.
    session_conns: Arc<DashMap<SessionId, ConnectionId>>,
    /// Pool slot each session occupies.
    session_slots: Arc<DashMap<SessionId, ConnectionId>>,
}

impl App {
    /// Wire every component from the configuration tree.
    #[must_use]
    pub fn new(config: VigilConfig) -> Arc<Self> {
        let events = EventBus::default();
        let registry = Arc::new(HandlerRegistry::new(events.clone()));
        let reliability = Arc::new(ReliabilityLayer::new(
            (&config.protocol).into(),
            events.clone(),
        ));
        let hub = Arc::new(SignalingHub::new(config.signal.clone()));
        let control = Arc::new(CallControl::new());
        let sessions = Arc::new(SessionManager::new(config.transport.clone(), control));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let controller = Arc::new(PerformanceController::new(config.performance.clone()));
        let monitor = Arc::new(LatencyMonitor::new(config.monitor.clone()));
        let auth = Arc::new(AuthSessionManager::new(config.session.clone()));

        let clients = StageClients {
            recognizer: Arc::new(DevRecognizer),
            intent: Arc::new(DevIntentClassifier),
            responder: Arc::new(DevResponder),
            synthesizer: Arc::new(DevSynthesizer::new(16_000)),
        };
        let pipeline = AudioPipeline::new(
            config.pipeline.clone(),
            config.breaker.clone(),
            clients,
            Arc::clone(&controller),
            Arc::clone(&monitor),
        );

        let app = Arc::new(Self {
            config,
            registry,
            reliability,
            hub,
            sessions,
            pool,
            controller,
            monitor,
            pipeline,
            auth,
            transports: Arc::new(DashMap::new()),
            conn_sessions: Arc::new(DashMap::new()),
            session_conns: Arc::new(DashMap::new()),
            session_slots: Arc::new(DashMap::new()),
        });
        app.register_handlers();
        app
    }

    fn register_handlers(self: &Arc<Self>) {
        self.registry.register(
            MessageType::AudioChunk,
            Arc::new(AudioChunkHandler {
                app: Arc::clone(self),
            }),
        );
        self.registry.register(
            MessageType::Heartbeat,
            Arc::new(HeartbeatHandler {
                app: Arc::clone(self),
            }),
        );
        self.registry.register(
            MessageType::SessionRecovery,
            Arc::new(RecoveryHandler {
                app: Arc::clone(self),
            }),
        );
        for message_type in [
            MessageType::WebrtcOffer,
            MessageType::WebrtcAnswer,
            MessageType::WebrtcIceCandidate,
        ] {
            self.registry.register(
                message_type,
                Arc::new(SignalForwardHandler {
                    hub: Arc::clone(&self.hub),
                }),
            );
        }
    }

    /// Build a reliability send callback over one connection's transport.
    fn send_fn(&self, connection_id: &ConnectionId) -> SendFn {
        let transport = self
            .transports
            .get(connection_id)
            .map(|t| Arc::clone(&t));
        Arc::new(move |frame: String| {
            let transport = transport.clone();
            Box::pin(async move {
                match transport {
                    Some(transport) => transport
                        .send(&frame)
                        .await
                        .map_err(|e| e.to_string()),
                    None => Err("connection gone".to_string()),
                }
            }) as SendFuture
        })
    }

    /// Send one envelope over a connection through the reliability layer.
    async fn send_envelope(&self, connection_id: &ConnectionId, envelope: Envelope) {
        let send = self.send_fn(connection_id);
        if let Err(e) = self.reliability.send(envelope, connection_id, send).await {
            tracing::debug!("send to {connection_id} failed: {e}");
        }
    }

    /// Establish the session for a connection on its first audio chunk.
    async fn ensure_session(
        &self,
        connection_id: &ConnectionId,
        user_id: &str,
        call_id: &str,
    ) -> anyhow::Result<()> {
        if self.sessions.session_for(user_id, call_id).is_some() {
            return Ok(());
        }
        let transport = self
            .transports
            .get(connection_id)
            .map(|t| Arc::clone(&t) as Arc<dyn Transport>)
            .context("connection transport missing")?;

        let slot = self
            .pool
            .acquire(AcquireRequest {
                user_id: user_id.to_string(),
                call_id: call_id.to_string(),
                kind: ChannelKind::Reliable,
                priority: 1,
            })
            .await?;
        let session = self
            .sessions
            .open_session(user_id, call_id, transport, None)?;
        self.conn_sessions
            .insert(connection_id.clone(), session.session_id.clone());
        self.session_conns
            .insert(session.session_id.clone(), connection_id.clone());
        self.session_slots.insert(session.session_id.clone(), slot);
        tracing::info!(
            "session {} established on {connection_id} for call {call_id}",
            session.session_id
        );
        Ok(())
    }

    /// Fan pipeline events out to every session observing the call.
    async fn fan_out(self: &Arc<Self>, event: PipelineEvent) {
        match event {
            PipelineEvent::ChunkAccepted {
                call_id, chunk_id, ..
            } => {
                self.send_status(&call_id, Some(chunk_id), "audio_received").await;
            }
            PipelineEvent::ChunkCompleted(result) => {
                self.fan_out_result(result).await;
            }
            PipelineEvent::ChunkFailed {
                call_id,
                chunk_id,
                kind,
                message,
            } => {
                let payload = MessagePayload::Error(ErrorPayload {
                    kind: kind.to_string(),
                    message,
                    retryable: kind == "backpressure" || kind == "stage_dependency",
                    retry_after_ms: (kind == "backpressure").then_some(
                        self.config.performance.backpressure_delay_ms,
                    ),
                });
                self.send_to_call(&call_id, payload).await;
                self.send_status(&call_id, Some(chunk_id), "rejected").await;
            }
            PipelineEvent::CacheHit { .. } => {}
        }
    }

    async fn fan_out_result(self: &Arc<Self>, result: PipelineResult) {
        let call_id = result.call_id.clone();
        if result.is_silence() {
            self.send_status(&call_id, Some(result.chunk_id), "no_speech").await;
            return;
        }
        if let Some(text) = &result.transcript {
            self.send_to_call(
                &call_id,
                MessagePayload::Transcript(TranscriptPayload {
                    call_id: call_id.clone(),
                    chunk_id: result.chunk_id.clone(),
                    text: text.clone(),
                    confidence: result.intent.as_ref().map_or(0.5, |i| i.confidence.max(0.5)),
                }),
            )
            .await;
        }
        if let Some(response) = &result.response {
            self.send_to_call(
                &call_id,
                MessagePayload::AiResponse(AiResponsePayload {
                    call_id: call_id.clone(),
                    chunk_id: result.chunk_id.clone(),
                    text: response.text.clone(),
                    should_terminate: response.should_terminate,
                    confidence: response.confidence,
                    strategy: response.strategy,
                }),
            )
            .await;
            if let Some(audio) = &response.response_audio {
                self.send_audio_response(&call_id, &result.chunk_id, audio.clone()).await;
            }
        }
        self.send_status(&call_id, Some(result.chunk_id), "response_sent").await;
    }

    async fn send_status(&self, call_id: &str, chunk_id: Option<String>, stage: &str) {
        let payload = MessagePayload::ProcessingStatus(ProcessingStatusPayload {
            call_id: call_id.to_string(),
            chunk_id,
            stage: stage.to_string(),
        });
        self.send_to_call(call_id, payload).await;
    }

    /// Send a control payload to every session observing the call.
    async fn send_to_call(&self, call_id: &str, payload: MessagePayload) {
        for session in self.sessions.sessions_observing(call_id) {
            let Some(connection_id) = self
                .session_conns
                .get(&session.session_id)
                .map(|c| c.clone())
            else {
                continue;
            };
            let envelope = Envelope::new(payload.clone(), SERVICE_SOURCE)
                .with_target(session.session_id.clone());
            self.send_envelope(&connection_id, envelope).await;
        }
    }

    /// Reply audio rides the session's audio transport (media when
    /// hybrid), outside the reliability layer.
    async fn send_audio_response(&self, call_id: &str, chunk_id: &str, audio: Vec<u8>) {
        let tier = self.controller.tier(call_id);
        let (encoding, sample_rate) = tier
            .map(|t| (t.codec(), t.sample_rate))
            .unwrap_or((AudioEncoding::Pcm, 16_000));
        let payload = MessagePayload::AudioResponse(AudioResponsePayload {
            call_id: call_id.to_string(),
            chunk_id: chunk_id.to_string(),
            encoding,
            sample_rate,
            audio_data: audio,
        });
        let envelope = Envelope::new(payload, SERVICE_SOURCE);
        let Ok(frame) = envelope.encode() else { return };
        for session in self.sessions.sessions_observing(call_id) {
            if let Err(e) = session.send_audio(&frame).await {
                tracing::debug!("audio send failed for {}: {e}", session.session_id);
                let _ = self.sessions.handle_media_failure(&session.session_id).await;
            }
        }
    }

    /// Drive one connection until it closes.
    async fn handle_connection(self: Arc<Self>, transport: ReliableTransport) {
        let connection_id: ConnectionId = Uuid::new_v4().to_string();
        let transport = Arc::new(transport);
        self.transports
            .insert(connection_id.clone(), Arc::clone(&transport));
        tracing::info!("connection {connection_id} accepted");

        loop {
            let frame = match transport.recv().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::info!("connection {connection_id} closed: {e}");
                    break;
                }
            };
            let reply = self.send_fn(&connection_id);
            if let Err(e) = self
                .reliability
                .receive(&frame, &connection_id, reply, &self.registry)
                .await
            {
                tracing::debug!("invalid frame on {connection_id}: {e}");
            }
        }

        // Teardown: release the pool slot, detach the session for
        // recovery, forget per-connection protocol state.
        self.transports.remove(&connection_id);
        if let Some((_, session_id)) = self.conn_sessions.remove(&connection_id) {
            self.session_conns.remove(&session_id);
            if let Some((_, slot)) = self.session_slots.remove(&session_id) {
                let _ = self.pool.release(&slot, ReleaseReason::Normal);
            }
            self.sessions.detach(&session_id);
        }
        self.reliability.forget_connection(&connection_id);
    }

    /// Run the service until ctrl-c.
    ///
    /// # Errors
    /// Fails when a listener cannot bind.
    pub async fn run(self: Arc<Self>, listen: SocketAddr, signal_listen: SocketAddr) -> anyhow::Result<()> {
        let listener = ReliableListener::bind(listen).await?;
        tracing::info!("listening on {}", listener.local_addr());
        let signal_listener = ReliableListener::bind(signal_listen).await?;
        tracing::info!("signaling on {}", signal_listener.local_addr());

        // Maintenance loops.
        let mut tasks = Vec::new();
        tasks.push(self.reliability.spawn_sweeper(Duration::from_millis(
            self.config.protocol.orphan_sweep_interval_ms,
        )));
        tasks.push(self.hub.spawn_maintenance());
        tasks.push(self.pool.spawn_sweeper());
        tasks.extend(self.controller.spawn_loops());
        tasks.push(self.auth.spawn_sweeper());
        tasks.push({
            let sessions = Arc::clone(&self.sessions);
            let interval = Duration::from_millis(self.config.transport.idle_timeout_ms / 4);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
                loop {
                    ticker.tick().await;
                    sessions.idle_pass().await;
                    sessions.sweep_detached();
                }
            })
        });
        tasks.push({
            let monitor = Arc::clone(&self.monitor);
            let interval = Duration::from_millis(self.config.monitor.sample_interval_ms);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let _ = monitor.detect_bottlenecks();
                    if let Some((cpu, memory)) = sample_resources() {
                        monitor.record_resources(cpu, memory);
                    }
                }
            })
        });

        // Pipeline fan-out.
        tasks.push({
            let app = Arc::clone(&self);
            let mut events = self.pipeline.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    app.fan_out(event).await;
                }
            })
        });

        // Accept loops, stopped by ctrl-c.
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(transport) => {
                        let app = Arc::clone(&self);
                        tokio::spawn(app.handle_connection(transport));
                    }
                    Err(e) => tracing::warn!("accept failed: {e}"),
                },
                accepted = signal_listener.accept() => match accepted {
                    Ok(transport) => {
                        let hub = Arc::clone(&self.hub);
                        tokio::spawn(crate::signal_server::handle_signal_connection(
                            hub, transport,
                        ));
                    }
                    Err(e) => tracing::warn!("signal accept failed: {e}"),
                },
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                    break;
                }
            }
        }

        // Orderly shutdown: stop accepting, drain waiters, finalize
        // sessions within the grace period, then cancel the loops.
        self.pool.shutdown();
        self.pipeline.shutdown();
        self.sessions.shutdown(SHUTDOWN_GRACE).await;
        for task in tasks {
            task.abort();
        }
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Sample process resource usage as `(cpu%, memory%)`.
///
/// Best effort from procfs; returns `None` on platforms without it.
fn sample_resources() -> Option<(f64, f64)> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cpu_percent = (load / num_cpus::get() as f64 * 100.0).min(100.0);

    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = 0.0f64;
    let mut available_kb = 0.0f64;
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total_kb = parts.next()?.parse().ok()?,
            Some("MemAvailable:") => available_kb = parts.next()?.parse().ok()?,
            _ => {}
        }
    }
    if total_kb <= 0.0 {
        return None;
    }
    let memory_percent = ((total_kb - available_kb) / total_kb * 100.0).clamp(0.0, 100.0);
    Some((cpu_percent, memory_percent))
}

/// `audio_chunk` -> session establishment + pipeline submission.
struct AudioChunkHandler {
    app: Arc<App>,
}

#[async_trait]
impl Handler for AudioChunkHandler {
    async fn handle(&self, envelope: &Envelope, connection_id: &ConnectionId) -> HandlerOutcome {
        let MessagePayload::AudioChunk(payload) = &envelope.payload else {
            return HandlerOutcome::default();
        };
        let user_id = envelope.metadata.source.clone();
        let call_id: CallId = payload.call_id.clone();

        if let Err(e) = self
            .app
            .ensure_session(connection_id, &user_id, &call_id)
            .await
        {
            tracing::warn!("session establishment failed on {connection_id}: {e}");
            let kind = match e.downcast_ref::<vigil_transport::TransportError>() {
                Some(vigil_transport::TransportError::UserLimitExceeded(_)) => "user_limit",
                Some(
                    vigil_transport::TransportError::AcquireTimeout(_)
                    | vigil_transport::TransportError::PoolShutdown,
                ) => "pool_exhausted",
                _ => "connection",
            };
            let error = MessagePayload::Error(ErrorPayload {
                kind: kind.to_string(),
                message: e.to_string(),
                retryable: kind != "connection",
                retry_after_ms: None,
            });
            self.app
                .send_envelope(connection_id, Envelope::new(error, SERVICE_SOURCE))
                .await;
            return HandlerOutcome::handled();
        }

        if let Some(session_id) = self.app.conn_sessions.get(connection_id) {
            self.app.sessions.touch(&session_id);
        }

        let chunk = payload.clone().into_chunk();
        if let Err(e) = self.app.pipeline.submit(chunk).await {
            let retry_hint = matches!(e, PipelineError::Backpressure(_))
                .then_some(self.app.config.performance.backpressure_delay_ms);
            let error = MessagePayload::Error(ErrorPayload {
                kind: e.kind().as_str().to_string(),
                message: e.to_string(),
                retryable: e.kind().retryable(),
                retry_after_ms: retry_hint,
            });
            self.app
                .send_envelope(connection_id, Envelope::new(error, SERVICE_SOURCE))
                .await;
        }
        HandlerOutcome::handled()
    }
}

/// `heartbeat` -> session activity.
struct HeartbeatHandler {
    app: Arc<App>,
}

#[async_trait]
impl Handler for HeartbeatHandler {
    async fn handle(&self, _envelope: &Envelope, connection_id: &ConnectionId) -> HandlerOutcome {
        if let Some(session_id) = self.app.conn_sessions.get(connection_id) {
            self.app.sessions.touch(&session_id);
        }
        HandlerOutcome::handled()
    }
}

/// `session_recovery` -> reattach a dropped connection.
struct RecoveryHandler {
    app: Arc<App>,
}

#[async_trait]
impl Handler for RecoveryHandler {
    async fn handle(&self, envelope: &Envelope, connection_id: &ConnectionId) -> HandlerOutcome {
        let MessagePayload::SessionRecovery(payload) = &envelope.payload else {
            return HandlerOutcome::default();
        };
        let Some(transport) = self
            .app
            .transports
            .get(connection_id)
            .map(|t| Arc::clone(&t) as Arc<dyn Transport>)
        else {
            return HandlerOutcome::default();
        };
        match self.app.sessions.recover_session(
            &payload.session_id,
            &payload.user_id,
            transport,
        ) {
            Ok(session) => {
                self.app
                    .conn_sessions
                    .insert(connection_id.clone(), session.session_id.clone());
                self.app
                    .session_conns
                    .insert(session.session_id.clone(), connection_id.clone());
                HandlerOutcome::with_data(serde_json::json!({ "recovered": true }))
            }
            Err(e) => {
                tracing::info!("recovery rejected on {connection_id}: {e}");
                let error = MessagePayload::Error(ErrorPayload {
                    kind: "validation".to_string(),
                    message: e.to_string(),
                    retryable: false,
                    retry_after_ms: None,
                });
                self.app
                    .send_envelope(connection_id, Envelope::new(error, SERVICE_SOURCE))
                    .await;
                HandlerOutcome::handled()
            }
        }
    }
}

/// `webrtc_*` -> hub forwarding between room peers.
struct SignalForwardHandler {
    hub: Arc<SignalingHub>,
}

#[async_trait]
impl Handler for SignalForwardHandler {
    async fn handle(&self, envelope: &Envelope, _connection_id: &ConnectionId) -> HandlerOutcome {
        let (kind, payload) = match &envelope.payload {
            MessagePayload::WebrtcOffer(p) => (ForwardKind::Offer, p),
            MessagePayload::WebrtcAnswer(p) => (ForwardKind::Answer, p),
            MessagePayload::WebrtcIceCandidate(p) => (ForwardKind::IceCandidate, p),
            _ => return HandlerOutcome::default(),
        };
        if let Err(e) = self.hub.forward(
            &payload.from_peer_id,
            &payload.target_peer_id,
            kind,
            payload.data.clone(),
        ) {
            tracing::debug!("signal forward failed: {e}");
        }
        HandlerOutcome::handled()
    }
}
