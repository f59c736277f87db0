//! Bounded connection pool.
//!
//! The pool is the inventory of transport-level connections: a fixed
//! maximum total, a per-user cap, an idle reuse cache, priority-based
//! eviction, and a priority-ordered waiting queue. `acquire` / `release`
//! hold one critical section briefly and never across I/O.
//!
//! # Acquire logic
//!
//! 1. Enforce the per-user cap on active connections.
//! 2. With reuse enabled, reactivate a cached idle connection of matching
//!    `(user, kind)`.
//! 3. At capacity, evict lower-priority non-critical connections
//!    (priority below the request's AND age at least `criticalWindow`),
//!    oldest-use first, up to a small bound.
//! 4. Otherwise park the request in the waiting queue with a deadline;
//!    waiters are served FIFO within priority as connections free up.

use crate::error::{Result, TransportError};
use crate::transport::ChannelKind;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vigil_core::config::PoolConfig;
use vigil_core::types::{CallId, ConnectionId, UserId};

/// Why a connection is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Orderly release; the connection may be cached for reuse.
    Normal,
    /// The connection failed; never cached.
    Error,
    /// Service shutdown; never cached.
    Shutdown,
}

/// A pooled connection record.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Channel kind the connection serves.
    pub kind: ChannelKind,
    /// Priority it was acquired at.
    pub priority: u8,
    /// Call currently bound, when active.
    pub call_id: Option<CallId>,
    /// Whether the connection is currently held by a session.
    pub active: bool,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    /// Age since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// An acquire request.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Requesting user.
    pub user_id: UserId,
    /// Call the connection will serve.
    pub call_id: CallId,
    /// Channel kind needed.
    pub kind: ChannelKind,
    /// Request priority in `0..priority_levels`.
    pub priority: u8,
}

/// A parked acquire waiting for capacity.
struct Waiter {
    request: AcquireRequest,
    seq: u64,
    deadline: Instant,
    reply: oneshot::Sender<Result<ConnectionId>>,
}

/// Mutable pool state behind the single critical section.
struct PoolState {
    connections: HashMap<ConnectionId, PooledConnection>,
    /// Idle connections cached for reuse, keyed by `(user, kind)`.
    reuse: LruCache<(UserId, ChannelKind), (ConnectionId, Instant)>,
    /// Waiting queue; drained in `(priority desc, seq asc)` order.
    waiting: Vec<Waiter>,
    waiter_seq: u64,
}

/// Counter snapshot for the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections created.
    pub created: u64,
    /// Acquires served from the reuse cache.
    pub reused: u64,
    /// Connections evicted for higher-priority requests.
    pub evicted: u64,
    /// Acquires rejected on the per-user cap.
    pub rejected_user_limit: u64,
    /// Waiters admitted when capacity freed up.
    pub waiting_queue_admits: u64,
    /// Waiters failed on their deadline.
    pub waiter_timeouts: u64,
    /// Connections released.
    pub released: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    rejected_user_limit: AtomicU64,
    waiting_queue_admits: AtomicU64,
    waiter_timeouts: AtomicU64,
    released: AtomicU64,
}

/// Bounded inventory of transport connections.
pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    counters: Counters,
    shutdown: std::sync::atomic::AtomicBool,
}

impl ConnectionPool {
    /// Create a pool with the given configuration.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let reuse_capacity =
            NonZeroUsize::new(config.max_connections.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                reuse: LruCache::new(reuse_capacity),
                waiting: Vec::new(),
                waiter_seq: 0,
            }),
            counters: Counters::default(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Acquire a connection, waiting up to the configured budget when the
    /// pool is saturated.
    ///
    /// # Errors
    /// - [`TransportError::UserLimitExceeded`] on the per-user cap
    /// - [`TransportError::AcquireTimeout`] when the wait budget elapses
    /// - [`TransportError::PoolShutdown`] during shutdown
    pub async fn acquire(&self, request: AcquireRequest) -> Result<ConnectionId> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(TransportError::PoolShutdown);
        }

        let receiver = {
            let mut state = self.lock();

            // 1. Per-user cap on active connections.
            let active = state
                .connections
                .values()
                .filter(|c| c.active && c.user_id == request.user_id)
                .count();
            if active >= self.config.max_per_user {
                self.counters
                    .rejected_user_limit
                    .fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::UserLimitExceeded(request.user_id));
            }

            // 2. Reuse a cached idle connection.
            if self.config.reuse_enabled {
                let key = (request.user_id.clone(), request.kind);
                if let Some((id, cached_at)) = state.reuse.pop(&key) {
                    let ttl = Duration::from_millis(self.config.idle_timeout_ms);
                    if cached_at.elapsed() <= ttl {
                        if let Some(conn) = state.connections.get_mut(&id) {
                            conn.active = true;
                            conn.call_id = Some(request.call_id.clone());
                            conn.priority = request.priority;
                            conn.last_used = Instant::now();
                            self.counters.reused.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!("reused connection {id} for {}", request.user_id);
                            return Ok(id);
                        }
                    } else {
                        // Expired in cache; drop the record entirely.
                        state.connections.remove(&id);
                    }
                }
            }

            // 3. Room available, or make some by eviction.
            if state.connections.len() < self.config.max_connections {
                return Ok(self.create_locked(&mut state, &request));
            }
            if self.evict_locked(&mut state, &request) > 0
                && state.connections.len() < self.config.max_connections
            {
                return Ok(self.create_locked(&mut state, &request));
            }

            // 4. Park in the waiting queue.
            let (tx, rx) = oneshot::channel();
            let seq = state.waiter_seq;
            state.waiter_seq += 1;
            state.waiting.push(Waiter {
                request: request.clone(),
                seq,
                deadline: Instant::now() + Duration::from_millis(self.config.waiter_timeout_ms),
                reply: tx,
            });
            tracing::debug!(
                "acquire parked for {} (priority {})",
                request.user_id,
                request.priority
            );
            rx
        };

        let budget = Duration::from_millis(self.config.waiter_timeout_ms);
        match tokio::time::timeout(budget, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::PoolShutdown),
            Err(_) => {
                // Our receiver just dropped; reap the closed waiter now
                // rather than waiting for the sweeper.
                let mut state = self.lock();
                state.waiting.retain(|w| !w.reply.is_closed());
                self.counters.waiter_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::AcquireTimeout(
                    self.config.waiter_timeout_ms,
                ))
            }
        }
    }

    /// Create a connection record. Caller holds the lock.
    fn create_locked(&self, state: &mut PoolState, request: &AcquireRequest) -> ConnectionId {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        state.connections.insert(
            id.clone(),
            PooledConnection {
                id: id.clone(),
                user_id: request.user_id.clone(),
                kind: request.kind,
                priority: request.priority,
                call_id: Some(request.call_id.clone()),
                active: true,
                created_at: now,
                last_used: now,
            },
        );
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("created connection {id} for {}", request.user_id);
        id
    }

    /// Evict lower-priority non-critical connections. Caller holds the
    /// lock. Returns the number evicted.
    ///
    /// A connection is critical while it is younger than `criticalWindow`
    /// or its priority is not strictly below the request's.
    fn evict_locked(&self, state: &mut PoolState, request: &AcquireRequest) -> usize {
        let critical_window = Duration::from_millis(self.config.critical_window_ms);
        let mut candidates: Vec<(u8, Instant, ConnectionId)> = state
            .connections
            .values()
            .filter(|c| c.priority < request.priority && c.age() >= critical_window)
            .map(|c| (c.priority, c.last_used, c.id.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut evicted = 0;
        for (_, _, id) in candidates.into_iter().take(self.config.eviction_batch) {
            if let Some(conn) = state.connections.remove(&id) {
                state.reuse.pop(&(conn.user_id.clone(), conn.kind));
                evicted += 1;
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("evicted connection {id} (priority {})", conn.priority);
            }
        }
        evicted
    }

    /// Release a connection.
    ///
    /// Non-fatal releases with reuse enabled park the connection in the
    /// reuse cache; otherwise the record is removed. Either way the
    /// waiting queue is drained to capacity.
    ///
    /// # Errors
    /// Fails when the connection is unknown.
    pub fn release(&self, id: &str, reason: ReleaseReason) -> Result<()> {
        let mut state = self.lock();
        let (user_id, kind) = {
            let Some(conn) = state.connections.get_mut(id) else {
                return Err(TransportError::ConnectionNotFound(id.to_string()));
            };
            conn.active = false;
            conn.call_id = None;
            conn.last_used = Instant::now();
            (conn.user_id.clone(), conn.kind)
        };
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        if reason == ReleaseReason::Normal && self.config.reuse_enabled {
            state.reuse.put((user_id, kind), (id.to_string(), Instant::now()));
        } else {
            state.connections.remove(id);
        }

        self.drain_waiting_locked(&mut state);
        Ok(())
    }

    /// Serve parked waiters while capacity allows. Caller holds the lock.
    fn drain_waiting_locked(&self, state: &mut PoolState) {
        loop {
            if state.connections.len() >= self.config.max_connections || state.waiting.is_empty() {
                return;
            }
            // Highest priority first; FIFO within a priority.
            let best = state
                .waiting
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.request
                        .priority
                        .cmp(&b.request.priority)
                        .then(b.seq.cmp(&a.seq))
                })
                .map(|(i, _)| i);
            let Some(index) = best else { return };
            let waiter = state.waiting.remove(index);
            if waiter.reply.is_closed() {
                continue; // Acquire future already timed out.
            }
            let id = self.create_locked(state, &waiter.request);
            self.counters
                .waiting_queue_admits
                .fetch_add(1, Ordering::Relaxed);
            let _ = waiter.reply.send(Ok(id));
        }
    }

    /// One sweeper pass: reap expired idle connections and fail overdue
    /// waiters. Returns `(reaped, failed_waiters)`.
    pub fn sweep(&self) -> (usize, usize) {
        let mut state = self.lock();
        let ttl = Duration::from_millis(self.config.idle_timeout_ms);

        let expired: Vec<ConnectionId> = state
            .connections
            .values()
            .filter(|c| !c.active && c.last_used.elapsed() > ttl)
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            if let Some(conn) = state.connections.remove(id) {
                state.reuse.pop(&(conn.user_id, conn.kind));
                tracing::debug!("reaped idle connection {id}");
            }
        }

        let now = Instant::now();
        let mut failed = 0;
        let mut remaining = Vec::with_capacity(state.waiting.len());
        for waiter in state.waiting.drain(..) {
            if waiter.deadline <= now || waiter.reply.is_closed() {
                failed += 1;
                self.counters.waiter_timeouts.fetch_add(1, Ordering::Relaxed);
                let _ = waiter.reply.send(Err(TransportError::AcquireTimeout(
                    self.config.waiter_timeout_ms,
                )));
            } else {
                remaining.push(waiter);
            }
        }
        state.waiting = remaining;

        // Expiries may have opened capacity.
        self.drain_waiting_locked(&mut state);
        (expired.len(), failed)
    }

    /// Spawn the periodic sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = Duration::from_millis(pool.config.cleanup_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.sweep();
            }
        })
    }

    /// Drain the waiting queue with `pool_shutdown` failures and mark the
    /// pool closed to further acquires.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut state = self.lock();
        for waiter in state.waiting.drain(..) {
            let _ = waiter.reply.send(Err(TransportError::PoolShutdown));
        }
        state.connections.clear();
        state.reuse.clear();
        tracing::info!("connection pool shut down");
    }

    /// Snapshot of one connection record.
    #[must_use]
    pub fn connection(&self, id: &str) -> Option<PooledConnection> {
        self.lock().connections.get(id).cloned()
    }

    /// Total connection records (active + cached).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Parked acquire requests.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            rejected_user_limit: self.counters.rejected_user_limit.load(Ordering::Relaxed),
            waiting_queue_admits: self.counters.waiting_queue_admits.load(Ordering::Relaxed),
            waiter_timeouts: self.counters.waiter_timeouts.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
        }
    }
}
