//! Authenticated session records and their lifecycle.

use crate::error::{Result, SessionError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_core::config::SessionConfig;
use vigil_core::types::{SessionId, UserId, now_ms};

/// An authenticated session bound to one device.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Digest of the externally derived device fingerprint.
    pub device_digest: [u8; 32],
    /// Creation timestamp (ms since epoch).
    pub created_at: u64,
    /// Last validated request (ms since epoch).
    pub last_activity_at: u64,
    /// Absolute expiry (ms since epoch); extended by activity.
    pub expires_at: u64,
    /// Set when a fingerprint mismatch invalidated the session.
    pub compromised: bool,
}

/// Events published by the lifecycle manager.
#[derive(Debug, Clone)]
pub enum SessionLifecycleEvent {
    /// A session was created.
    Created {
        /// Session id.
        session_id: SessionId,
        /// Owning user.
        user_id: UserId,
    },
    /// The oldest session was terminated to honor the per-user cap.
    CapEvicted {
        /// Session id.
        session_id: SessionId,
    },
    /// A session expired (idle or absolute) and was reaped.
    Expired {
        /// Session id.
        session_id: SessionId,
    },
    /// A fingerprint mismatch invalidated a session.
    Compromised {
        /// Session id.
        session_id: SessionId,
    },
    /// Activity extended a session's expiry.
    Extended {
        /// Session id.
        session_id: SessionId,
        /// New absolute expiry (ms since epoch).
        expires_at: u64,
    },
}

/// Digest a device fingerprint for storage and comparison.
#[must_use]
pub fn digest_fingerprint(fingerprint: &str) -> [u8; 32] {
    *blake3::hash(fingerprint.as_bytes()).as_bytes()
}

/// Lifecycle manager for authenticated sessions.
pub struct AuthSessionManager {
    config: SessionConfig,
    sessions: DashMap<SessionId, AuthSession>,
    events: broadcast::Sender<SessionLifecycleEvent>,
}

impl AuthSessionManager {
    /// Create a manager with the given configuration.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            config,
            sessions: DashMap::new(),
            events,
        }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionLifecycleEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SessionLifecycleEvent) {
        let _ = self.events.send(event);
    }

    /// Create a session after successful authentication.
    ///
    /// Enforces the per-user cap by terminating the user's oldest
    /// session when the cap is reached.
    pub fn create_session(&self, user_id: &str, device_fingerprint: &str) -> AuthSession {
        // Cap check: count this user's sessions, evict the oldest.
        let mut owned: Vec<(u64, SessionId)> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| (s.created_at, s.session_id.clone()))
            .collect();
        if owned.len() >= self.config.max_sessions_per_user {
            owned.sort_unstable();
            let excess = owned.len() + 1 - self.config.max_sessions_per_user;
            for (_, session_id) in owned.into_iter().take(excess) {
                self.sessions.remove(&session_id);
                tracing::info!("evicted session {session_id} for user cap");
                self.publish(SessionLifecycleEvent::CapEvicted { session_id });
            }
        }

        let now = now_ms();
        let session = AuthSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            device_digest: digest_fingerprint(device_fingerprint),
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.config.session_duration_ms,
            compromised: false,
        };
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        self.publish(SessionLifecycleEvent::Created {
            session_id: session.session_id.clone(),
            user_id: user_id.to_string(),
        });
        tracing::debug!("session {} created for {user_id}", session.session_id);
        session
    }

    /// Validate a request against a session.
    ///
    /// Checks existence, compromise, expiry (idle and absolute), and the
    /// device fingerprint. A mismatch marks the session compromised and
    /// invalidates it. Activity extends the expiry once the remaining
    /// lifetime drops below half the full duration.
    pub fn validate(&self, session_id: &str, device_fingerprint: &str) -> Result<AuthSession> {
        let now = now_ms();
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if entry.compromised {
            return Err(SessionError::Compromised(session_id.to_string()));
        }
        if now >= entry.expires_at
            || now.saturating_sub(entry.last_activity_at) > self.config.idle_timeout_ms
        {
            drop(entry);
            self.sessions.remove(session_id);
            self.publish(SessionLifecycleEvent::Expired {
                session_id: session_id.to_string(),
            });
            return Err(SessionError::Expired(session_id.to_string()));
        }
        if entry.device_digest != digest_fingerprint(device_fingerprint) {
            entry.compromised = true;
            drop(entry);
            self.sessions.remove(session_id);
            tracing::warn!("session {session_id} compromised by device mismatch");
            self.publish(SessionLifecycleEvent::Compromised {
                session_id: session_id.to_string(),
            });
            return Err(SessionError::DeviceMismatch(session_id.to_string()));
        }

        entry.last_activity_at = now;
        let remaining = entry.expires_at.saturating_sub(now);
        if remaining < self.config.session_duration_ms / 2 {
            entry.expires_at = now + self.config.session_duration_ms;
            let expires_at = entry.expires_at;
            let session = entry.clone();
            drop(entry);
            self.publish(SessionLifecycleEvent::Extended {
                session_id: session_id.to_string(),
                expires_at,
            });
            return Ok(session);
        }
        Ok(entry.clone())
    }

    /// Explicitly terminate a session.
    pub fn terminate(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// One sweeper pass reaping idle and absolutely expired sessions.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| {
                now >= s.expires_at
                    || now.saturating_sub(s.last_activity_at) > self.config.idle_timeout_ms
            })
            .map(|s| s.session_id.clone())
            .collect();
        let count = expired.len();
        for session_id in expired {
            self.sessions.remove(&session_id);
            tracing::debug!("session {session_id} expired");
            self.publish(SessionLifecycleEvent::Expired { session_id });
        }
        count
    }

    /// Spawn the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(manager.config.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        })
    }

    /// Active sessions for one user.
    #[must_use]
    pub fn sessions_for(&self, user_id: &str) -> Vec<AuthSession> {
        self.sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect()
    }

    /// Total active sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
