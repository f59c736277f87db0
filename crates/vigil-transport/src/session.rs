//! Per-peer transport sessions.
//!
//! A session binds an admitted, externally authenticated connection to a
//! `(user, call)` pair and manages the transport policy: every session
//! keeps the reliable transport for control and text; when media is
//! negotiated and preferred, audio upgrades onto the media transport
//! (`hybrid`). Media failure falls back to `reliable` when enabled,
//! otherwise the session terminates.
//!
//! # State machine
//!
//! ```text
//! new -> connected -> { idle | transferring | terminated | error }
//!         ^   |
//!         |   +-- idleTimeout --> idle
//!         +------ any inbound message
//! ```
//!
//! Sessions subscribe to a per-call control channel; external systems
//! inject `callTransfer` / `callTerminate` events which are translated
//! into `connection_status` messages toward the peer and into state
//! transitions.

use crate::error::{Result, TransportError};
use crate::transport::Transport;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_core::config::TransportConfig;
use vigil_core::envelope::{
    ConnectionStatusPayload, Envelope, HeartbeatPayload, MessagePayload,
};
use vigil_core::types::{CallId, SessionId, UserId, now_ms, status_code};

/// Transport composition of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// All traffic on the reliable transport.
    Reliable,
    /// All traffic on the media transport (not used in practice; media
    /// always rides alongside a reliable control channel).
    Media,
    /// Audio on media, control and text on reliable.
    Hybrid,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not yet serving traffic.
    New,
    /// Serving traffic.
    Connected,
    /// Silent past the idle timeout; revived by any inbound message.
    Idle,
    /// A call transfer is in progress.
    Transferring,
    /// Finished; removed from the manager.
    Terminated,
    /// Failed on an unhandled invariant.
    Error,
}

/// Cross-instance control events injected per call.
#[derive(Debug, Clone)]
pub enum CallControlEvent {
    /// Transfer the call to another destination.
    Transfer {
        /// Transfer destination.
        target: String,
    },
    /// Terminate the call.
    Terminate {
        /// Human-readable reason.
        reason: String,
    },
}

/// In-process stand-in for the cross-instance call control channel.
///
/// The distributed pub/sub itself is out of scope; components interact
/// with this bus only through subscribe and publish, so swapping in a
/// networked implementation is a composition-root concern.
#[derive(Default)]
pub struct CallControl {
    channels: DashMap<CallId, broadcast::Sender<CallControlEvent>>,
}

impl CallControl {
    /// Create an empty control bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to control events for `call_id`.
    #[must_use]
    pub fn subscribe(&self, call_id: &str) -> broadcast::Receiver<CallControlEvent> {
        self.channels
            .entry(call_id.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }

    /// Publish a control event for `call_id`.
    pub fn publish(&self, call_id: &str, event: CallControlEvent) {
        if let Some(sender) = self.channels.get(call_id) {
            let _ = sender.send(event);
        }
    }

    /// Drop the channel for a finished call.
    pub fn clear(&self, call_id: &str) {
        self.channels.remove(call_id);
    }
}

/// Events published by the session manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session admitted and serving.
    Connected {
        /// Session id.
        session_id: SessionId,
    },
    /// Session upgraded to hybrid.
    Upgraded {
        /// Session id.
        session_id: SessionId,
    },
    /// Media failed; session reverted to reliable.
    FellBack {
        /// Session id.
        session_id: SessionId,
    },
    /// Session went idle.
    Idle {
        /// Session id.
        session_id: SessionId,
    },
    /// Idle session revived by inbound traffic.
    Resumed {
        /// Session id.
        session_id: SessionId,
    },
    /// Call transfer started.
    Transferring {
        /// Session id.
        session_id: SessionId,
        /// Transfer destination.
        target: String,
    },
    /// Session finished.
    Terminated {
        /// Session id.
        session_id: SessionId,
        /// Termination reason.
        reason: String,
    },
    /// A dropped connection reattached within the recovery window.
    Recovered {
        /// Session id.
        session_id: SessionId,
    },
}

/// A live per-peer session.
pub struct Session {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Observed call.
    pub call_id: CallId,
    /// Creation timestamp (ms since epoch).
    pub started_at: u64,
    last_activity_at: AtomicU64,
    state: Mutex<SessionState>,
    kind: Mutex<TransportKind>,
    reliable: Mutex<Arc<dyn Transport>>,
    media: Mutex<Option<Arc<dyn Transport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    fn new(
        user_id: &str,
        call_id: &str,
        reliable: Arc<dyn Transport>,
        media: Option<Arc<dyn Transport>>,
        kind: TransportKind,
    ) -> Self {
        let now = now_ms();
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            call_id: call_id.to_string(),
            started_at: now,
            last_activity_at: AtomicU64::new(now),
            state: Mutex::new(SessionState::New),
            kind: Mutex::new(kind),
            reliable: Mutex::new(reliable),
            media: Mutex::new(media),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Current transport composition.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        *self.kind.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Last inbound activity (ms since epoch).
    #[must_use]
    pub fn last_activity_at(&self) -> u64 {
        self.last_activity_at.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
    }

    fn reliable_transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.reliable.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Transport currently carrying audio frames.
    #[must_use]
    pub fn audio_transport(&self) -> Arc<dyn Transport> {
        if self.kind() == TransportKind::Hybrid {
            let media = self.media.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(media) = media.as_ref() {
                return Arc::clone(media);
            }
        }
        self.reliable_transport()
    }

    /// Send a control frame over the reliable transport.
    ///
    /// # Errors
    /// Propagates the transport failure.
    pub async fn send_control(&self, frame: &str) -> Result<()> {
        self.reliable_transport().send(frame).await
    }

    /// Send an audio frame over the active audio transport.
    ///
    /// # Errors
    /// Propagates the transport failure.
    pub async fn send_audio(&self, frame: &str) -> Result<()> {
        self.audio_transport().send(frame).await
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .field("kind", &self.kind())
            .finish()
    }
}

/// A session whose connection dropped, parked for recovery.
struct DetachedSession {
    session: Arc<Session>,
    detached_at: u64,
}

/// Manages per-peer sessions and the transport policy.
pub struct SessionManager {
    config: TransportConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    by_user_call: DashMap<(UserId, CallId), SessionId>,
    detached: DashMap<SessionId, DetachedSession>,
    control: Arc<CallControl>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create a manager using `control` as the per-call control bus.
    #[must_use]
    pub fn new(config: TransportConfig, control: Arc<CallControl>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            sessions: DashMap::new(),
            by_user_call: DashMap::new(),
            detached: DashMap::new(),
            control,
            events,
        }
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Admit a connection and produce a session.
    ///
    /// When configured to prefer media and a negotiated media transport is
    /// supplied, the session starts hybrid; otherwise reliable.
    ///
    /// # Errors
    /// Rejects when an active session already exists for `(user, call)`.
    pub fn open_session(
        self: &Arc<Self>,
        user_id: &str,
        call_id: &str,
        reliable: Arc<dyn Transport>,
        media: Option<Arc<dyn Transport>>,
    ) -> Result<Arc<Session>> {
        let key = (user_id.to_string(), call_id.to_string());
        if self.by_user_call.contains_key(&key) {
            return Err(TransportError::DuplicateSession {
                user: user_id.to_string(),
                call: call_id.to_string(),
            });
        }

        let upgraded = self.config.prefer_media && media.is_some();
        let kind = if upgraded {
            TransportKind::Hybrid
        } else {
            TransportKind::Reliable
        };
        let session = Arc::new(Session::new(user_id, call_id, reliable, media, kind));
        session.set_state(SessionState::Connected);

        self.sessions
            .insert(session.session_id.clone(), Arc::clone(&session));
        self.by_user_call.insert(key, session.session_id.clone());

        self.spawn_control_task(&session);
        self.spawn_heartbeat_task(&session);

        self.publish(SessionEvent::Connected {
            session_id: session.session_id.clone(),
        });
        if upgraded {
            tracing::info!("session {} upgraded to hybrid", session.session_id);
            self.publish(SessionEvent::Upgraded {
                session_id: session.session_id.clone(),
            });
        }
        tracing::debug!(
            "session {} opened for user {user_id} call {call_id} ({kind:?})",
            session.session_id
        );
        Ok(session)
    }

    /// Per-call control subscription: translate external transfer and
    /// terminate events into peer messages and state transitions.
    fn spawn_control_task(self: &Arc<Self>, session: &Arc<Session>) {
        let manager = Arc::clone(self);
        let task_session = Arc::clone(session);
        let mut receiver = self.control.subscribe(&task_session.call_id);
        let task = tokio::spawn(async move {
            let session = task_session;
            loop {
                match receiver.recv().await {
                    Ok(CallControlEvent::Transfer { target }) => {
                        session.set_state(SessionState::Transferring);
                        let status = status_frame(
                            status_code::GOING_AWAY,
                            &format!("transfer:{target}"),
                            &session.session_id,
                        );
                        if let Err(e) = session.send_control(&status).await {
                            tracing::warn!(
                                "transfer notice failed for {}: {e}",
                                session.session_id
                            );
                        }
                        manager.publish(SessionEvent::Transferring {
                            session_id: session.session_id.clone(),
                            target,
                        });
                    }
                    Ok(CallControlEvent::Terminate { reason }) => {
                        let _ = manager.terminate(&session.session_id, &reason).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "control channel lagged by {skipped} for call {}",
                            session.call_id
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        session
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    /// Heartbeat emission on the reliable transport.
    fn spawn_heartbeat_task(self: &Arc<Self>, session: &Arc<Session>) {
        let manager = Arc::clone(self);
        let task_session = Arc::clone(session);
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let task = tokio::spawn(async move {
            let session = task_session;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let envelope = Envelope::new(
                    MessagePayload::Heartbeat(HeartbeatPayload { sent_at: now_ms() }),
                    session.session_id.clone(),
                );
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!("heartbeat encode failed: {e}");
                        continue;
                    }
                };
                if session.send_control(&frame).await.is_err() {
                    tracing::info!(
                        "heartbeat failed; detaching session {}",
                        session.session_id
                    );
                    manager.detach(&session.session_id);
                    return;
                }
            }
        });
        session
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    /// Record inbound activity; revives idle sessions.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.get(session_id) {
            session.last_activity_at.store(now_ms(), Ordering::Relaxed);
            let mut state = session.lock_state();
            if *state == SessionState::Idle {
                *state = SessionState::Connected;
                drop(state);
                self.publish(SessionEvent::Resumed {
                    session_id: session_id.to_string(),
                });
            }
        }
    }

    /// Media channel failed: fall back to reliable or terminate.
    ///
    /// # Errors
    /// Propagates termination failures when fallback is disabled.
    pub async fn handle_media_failure(&self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| TransportError::SessionNotFound(session_id.to_string()))?;

        if self.config.fallback_enabled {
            {
                let mut kind = session.kind.lock().unwrap_or_else(|p| p.into_inner());
                *kind = TransportKind::Reliable;
            }
            let media = session
                .media
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            if let Some(media) = media {
                let _ = media.close().await;
            }
            tracing::info!("session {session_id} fell back to reliable");
            self.publish(SessionEvent::FellBack {
                session_id: session_id.to_string(),
            });
            Ok(())
        } else {
            self.terminate(session_id, "transport_failed").await
        }
    }

    /// One idle pass: connected sessions silent past the idle timeout go
    /// idle; idle sessions silent past twice the timeout terminate.
    pub async fn idle_pass(&self) {
        let now = now_ms();
        let idle_after = self.config.idle_timeout_ms;
        let mut to_idle = Vec::new();
        let mut to_terminate = Vec::new();
        for entry in self.sessions.iter() {
            let silent = now.saturating_sub(entry.last_activity_at());
            match entry.state() {
                SessionState::Connected if silent > idle_after => {
                    to_idle.push(entry.session_id.clone());
                }
                SessionState::Idle if silent > idle_after.saturating_mul(2) => {
                    to_terminate.push(entry.session_id.clone());
                }
                _ => {}
            }
        }
        for session_id in to_idle {
            if let Some(session) = self.sessions.get(&session_id) {
                session.set_state(SessionState::Idle);
            }
            self.publish(SessionEvent::Idle {
                session_id: session_id.clone(),
            });
            tracing::debug!("session {session_id} went idle");
        }
        for session_id in to_terminate {
            let _ = self.terminate(&session_id, "idle_timeout").await;
        }
    }

    /// Park a session whose reliable connection dropped, keeping it
    /// recoverable for the configured window.
    pub fn detach(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        self.by_user_call
            .remove(&(session.user_id.clone(), session.call_id.clone()));
        session.abort_tasks();
        self.detached.insert(
            session_id.to_string(),
            DetachedSession {
                session,
                detached_at: now_ms(),
            },
        );
        tracing::debug!("session {session_id} detached");
    }

    /// Reattach a recovered connection to its detached session.
    ///
    /// # Errors
    /// Rejects when the session is unknown, the recovery window elapsed,
    /// or the claimed user does not match.
    pub fn recover_session(
        self: &Arc<Self>,
        session_id: &str,
        user_id: &str,
        reliable: Arc<dyn Transport>,
    ) -> Result<Arc<Session>> {
        let Some((_, detached)) = self.detached.remove(session_id) else {
            return Err(TransportError::RecoveryRejected(format!(
                "no detached session {session_id}"
            )));
        };
        let age = now_ms().saturating_sub(detached.detached_at);
        if age > self.config.recovery_window_ms {
            return Err(TransportError::RecoveryRejected(format!(
                "recovery window elapsed ({age}ms)"
            )));
        }
        let session = detached.session;
        if session.user_id != user_id {
            return Err(TransportError::RecoveryRejected(
                "user mismatch".to_string(),
            ));
        }

        {
            let mut guard = session.reliable.lock().unwrap_or_else(|p| p.into_inner());
            *guard = reliable;
        }
        session.set_state(SessionState::Connected);
        session.last_activity_at.store(now_ms(), Ordering::Relaxed);

        self.sessions
            .insert(session.session_id.clone(), Arc::clone(&session));
        self.by_user_call.insert(
            (session.user_id.clone(), session.call_id.clone()),
            session.session_id.clone(),
        );
        self.spawn_control_task(&session);
        self.spawn_heartbeat_task(&session);

        self.publish(SessionEvent::Recovered {
            session_id: session_id.to_string(),
        });
        tracing::info!("session {session_id} recovered after {age}ms");
        Ok(session)
    }

    /// Terminate a session: notify the peer, close transports, clear the
    /// call subscription, and evict the record.
    ///
    /// # Errors
    /// Fails when the session is unknown.
    pub async fn terminate(&self, session_id: &str, reason: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Err(TransportError::SessionNotFound(session_id.to_string()));
        };
        self.by_user_call
            .remove(&(session.user_id.clone(), session.call_id.clone()));
        session.set_state(SessionState::Terminated);

        // Best-effort close notice before dropping the transports.
        let code = if reason == "transport_failed" {
            status_code::INTERNAL_ERROR
        } else {
            status_code::NORMAL
        };
        let notice = status_frame(code, reason, session_id);
        let _ = session.send_control(&notice).await;
        let _ = session.reliable_transport().close().await;
        let media = session
            .media
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(media) = media {
            let _ = media.close().await;
        }

        // Last session observing the call clears the control channel.
        let observers = self
            .sessions
            .iter()
            .filter(|s| s.call_id == session.call_id)
            .count();
        if observers == 0 {
            self.control.clear(&session.call_id);
        }

        self.publish(SessionEvent::Terminated {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        });
        tracing::info!("session {session_id} terminated: {reason}");
        // Aborting last lets a control task that called terminate finish
        // the close notice above before its own cancellation lands.
        session.abort_tasks();
        Ok(())
    }

    /// Reap detached sessions whose recovery window elapsed.
    pub fn sweep_detached(&self) -> usize {
        let now = now_ms();
        let window = self.config.recovery_window_ms;
        let expired: Vec<SessionId> = self
            .detached
            .iter()
            .filter(|d| now.saturating_sub(d.detached_at) > window)
            .map(|d| d.key().clone())
            .collect();
        let count = expired.len();
        for session_id in expired {
            self.detached.remove(&session_id);
            tracing::debug!("detached session {session_id} expired");
        }
        count
    }

    /// Terminate every session, bounded by `grace` per session batch.
    pub async fn shutdown(&self, grace: Duration) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.session_id.clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for session_id in ids {
            if let Some(session) = self.sessions.get(&session_id).map(|s| Arc::clone(&s)) {
                let notice = status_frame(status_code::GOING_AWAY, "shutdown", &session_id);
                handles.push(async move {
                    let _ = session.send_control(&notice).await;
                });
            }
        }
        let _ = tokio::time::timeout(grace, futures_util::future::join_all(handles)).await;

        let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.session_id.clone()).collect();
        for session_id in ids {
            let _ = self.terminate(&session_id, "shutdown").await;
        }
    }

    /// Live session lookup by id.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s))
    }

    /// Live session lookup by `(user, call)`.
    #[must_use]
    pub fn session_for(&self, user_id: &str, call_id: &str) -> Option<Arc<Session>> {
        let key = (user_id.to_string(), call_id.to_string());
        let session_id = self.by_user_call.get(&key)?.clone();
        self.session(&session_id)
    }

    /// Live sessions observing a call.
    #[must_use]
    pub fn sessions_observing(&self, call_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| s.call_id == call_id)
            .map(|s| Arc::clone(&s))
            .collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Build a `connection_status` frame.
fn status_frame(code: u16, reason: &str, source: &str) -> String {
    let envelope = Envelope::new(
        MessagePayload::ConnectionStatus(ConnectionStatusPayload {
            code,
            reason: reason.to_string(),
        }),
        source,
    );
    // Status payloads are small; encoding cannot exceed the frame cap.
    envelope.encode().unwrap_or_default()
}
