//! Connection pool scenarios: the critical-window eviction rule, the
//! waiting queue, and per-user caps, plus the session cap invariant in
//! the auth session manager.

use std::sync::Arc;
use std::time::Duration;
use vigil_core::config::{PoolConfig, SessionConfig};
use vigil_session::AuthSessionManager;
use vigil_transport::error::TransportError;
use vigil_transport::pool::{AcquireRequest, ConnectionPool, ReleaseReason};
use vigil_transport::transport::ChannelKind;

fn request(user: &str, priority: u8) -> AcquireRequest {
    AcquireRequest {
        user_id: user.to_string(),
        call_id: format!("call-{user}"),
        kind: ChannelKind::Reliable,
        priority,
    }
}

#[tokio::test]
async fn critical_window_forbids_eviction_and_waiter_completes() {
    // Capacity 2, both filled at priority 0, criticalWindow still open.
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_connections: 2,
        max_per_user: 2,
        critical_window_ms: 60_000,
        waiter_timeout_ms: 5_000,
        ..Default::default()
    }));
    let first = pool.acquire(request("user-a", 0)).await.unwrap();
    let _second = pool.acquire(request("user-b", 0)).await.unwrap();

    // Priority 2 request: eviction is forbidden, so it queues.
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(request("user-c", 2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.waiting_count(), 1);
    assert_eq!(pool.stats().evicted, 0);

    // A holder releases; the waiter completes.
    pool.release(&first, ReleaseReason::Error).unwrap();
    let granted = waiter.await.unwrap().unwrap();
    assert!(pool.connection(&granted).unwrap().active);
    assert_eq!(pool.stats().waiting_queue_admits, 1);
}

#[tokio::test]
async fn aged_lower_priority_connections_are_evicted() {
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 2,
        max_per_user: 2,
        critical_window_ms: 10,
        waiter_timeout_ms: 1_000,
        ..Default::default()
    });
    pool.acquire(request("user-a", 0)).await.unwrap();
    pool.acquire(request("user-b", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let granted = pool.acquire(request("user-c", 3)).await.unwrap();
    assert!(pool.connection(&granted).is_some());
    assert!(pool.stats().evicted >= 1);
    assert!(pool.connection_count() <= 2);
}

#[tokio::test]
async fn per_user_cap_rejects_before_anything_else() {
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 8,
        max_per_user: 1,
        ..Default::default()
    });
    pool.acquire(request("user-a", 0)).await.unwrap();
    let err = pool.acquire(request("user-a", 3)).await.unwrap_err();
    assert!(matches!(err, TransportError::UserLimitExceeded(_)));
    assert_eq!(pool.stats().rejected_user_limit, 1);
}

#[tokio::test]
async fn reuse_cache_serves_same_user_and_kind() {
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: 4,
        reuse_enabled: true,
        ..Default::default()
    });
    let id = pool.acquire(request("user-a", 0)).await.unwrap();
    pool.release(&id, ReleaseReason::Normal).unwrap();

    let again = pool.acquire(request("user-a", 0)).await.unwrap();
    assert_eq!(again, id);
    assert_eq!(pool.stats().reused, 1);

    // A different user never receives someone else's connection.
    let other = pool.acquire(request("user-b", 0)).await.unwrap();
    assert_ne!(other, id);
}

#[tokio::test]
async fn shutdown_fails_waiters_with_pool_shutdown() {
    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_connections: 1,
        critical_window_ms: 60_000,
        waiter_timeout_ms: 10_000,
        ..Default::default()
    }));
    pool.acquire(request("user-a", 0)).await.unwrap();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(request("user-b", 0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(TransportError::PoolShutdown)
    ));
}

#[test]
fn session_cap_invariant_holds_under_churn() {
    let manager = AuthSessionManager::new(SessionConfig {
        max_sessions_per_user: 3,
        ..Default::default()
    });
    for _ in 0..20 {
        manager.create_session("user-a", "device-a");
        assert!(manager.sessions_for("user-a").len() <= 3);
    }
    assert_eq!(manager.sessions_for("user-a").len(), 3);
}
