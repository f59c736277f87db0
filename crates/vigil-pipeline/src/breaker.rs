//! Circuit breaker around external stage dependencies.
//!
//! One breaker wraps each dependency (recognizer, intent service,
//! response generator, synthesizer). State machine:
//!
//! ```text
//! closed --[error rate >= threshold over >= volume calls]--> open
//! open --[resetTimeout elapsed]--> halfOpen
//! halfOpen --[all probes succeed]--> closed
//! halfOpen --[any probe fails]--> open
//! ```
//!
//! Every wrapped call runs under a deadline; timeouts count as failures.
//! While open, calls short-circuit with a distinguished error and never
//! reach the dependency.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use vigil_core::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    /// Calls pass through; outcomes are recorded.
    Closed,
    /// Calls short-circuit until the reset timeout passes.
    Open,
    /// A bounded number of probe calls decide the next state.
    HalfOpen,
}

/// Error returned by a wrapped call.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; the dependency was not called.
    Open,
    /// The call exceeded the breaker's deadline.
    Timeout,
    /// The dependency itself failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "circuit open"),
            Self::Timeout => write!(f, "call timed out"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

/// Counter snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Breaker name (the wrapped dependency).
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Total recorded failures.
    pub failures: u64,
    /// Total recorded successes.
    pub successes: u64,
    /// Total calls that reached the dependency.
    pub total_calls: u64,
    /// Calls short-circuited while open.
    pub short_circuited: u64,
}

struct Inner {
    state: BreakerState,
    /// Recent call outcomes; true = success.
    window: VecDeque<bool>,
    failures: u64,
    successes: u64,
    total_calls: u64,
    short_circuited: u64,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    half_open_admitted: u32,
    half_open_successes: u32,
}

/// Three-state gate around one external dependency.
///
/// State transitions are serialized behind one mutex; the wrapped call
/// itself runs outside the lock.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker named after the dependency it wraps.
    #[must_use]
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                failures: 0,
                successes: 0,
                total_calls: 0,
                short_circuited: 0,
                last_failure_at: None,
                next_attempt_at: None,
                half_open_admitted: 0,
                half_open_successes: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run `operation` through the breaker under the configured deadline.
    ///
    /// # Errors
    /// - [`BreakerError::Open`] when the breaker short-circuits
    /// - [`BreakerError::Timeout`] when the deadline elapses (counted as
    ///   a failure)
    /// - [`BreakerError::Inner`] for dependency failures
    pub async fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_admit() {
            return Err(BreakerError::Open);
        }

        let deadline = Duration::from_millis(self.config.call_timeout_ms);
        match tokio::time::timeout(deadline, operation).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
            Err(_elapsed) => {
                self.record_failure();
                Err(BreakerError::Timeout)
            }
        }
    }

    /// Decide whether a call may proceed, transitioning open -> halfOpen
    /// when the reset timeout has passed.
    fn try_admit(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let ready = inner
                    .next_attempt_at
                    .is_some_and(|at| Instant::now() >= at);
                if ready {
                    tracing::info!("breaker {} half-open", self.name);
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_admitted = 1;
                    inner.half_open_successes = 0;
                    true
                } else {
                    inner.short_circuited += 1;
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_calls {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    inner.short_circuited += 1;
                    false
                }
            }
        }
    }

    fn push_outcome(&self, inner: &mut Inner, success: bool) {
        inner.window.push_back(success);
        while inner.window.len() > self.config.window_size.max(1) {
            inner.window.pop_front();
        }
        inner.total_calls += 1;
        if success {
            inner.successes += 1;
        } else {
            inner.failures += 1;
            inner.last_failure_at = Some(Instant::now());
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        self.push_outcome(&mut inner, true);
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.half_open_max_calls {
                tracing::info!("breaker {} closed", self.name);
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.next_attempt_at = None;
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        self.push_outcome(&mut inner, false);
        match inner.state {
            // A single half-open failure reopens.
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Closed => {
                let recent = inner.window.len() as u32;
                if recent >= self.config.volume_threshold {
                    let errors = inner.window.iter().filter(|ok| !**ok).count();
                    let rate = errors as f64 / inner.window.len() as f64 * 100.0;
                    if rate >= self.config.error_threshold_percent {
                        self.trip(&mut inner);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        tracing::warn!("breaker {} opened", self.name);
        inner.state = BreakerState::Open;
        inner.next_attempt_at =
            Some(Instant::now() + Duration::from_millis(self.config.reset_timeout_ms));
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Counter snapshot.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            total_calls: inner.total_calls,
            short_circuited: inner.short_circuited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            volume_threshold: 10,
            error_threshold_percent: 50.0,
            reset_timeout_ms: 50,
            half_open_max_calls: 3,
            window_size: 64,
            call_timeout_ms: 40,
        }
    }

    async fn ok_call(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.call(async { Ok::<_, &'static str>(1) }).await
    }

    async fn failing_call(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.call(async { Err::<u32, _>("boom") }).await
    }

    #[tokio::test]
    async fn test_closed_passes_calls() {
        let breaker = CircuitBreaker::new("recognizer", test_config());
        assert_eq!(ok_call(&breaker).await.unwrap(), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().successes, 1);
    }

    #[tokio::test]
    async fn test_opens_on_error_rate_over_volume() {
        let breaker = CircuitBreaker::new("recognizer", test_config());
        // 10 calls, 6 failures: volume met, 60% >= 50%.
        for i in 0..10 {
            if i < 6 {
                let _ = failing_call(&breaker).await;
            } else {
                let _ = ok_call(&breaker).await;
            }
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // The 11th call short-circuits without touching the dependency.
        let result = ok_call(&breaker).await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(breaker.snapshot().total_calls, 10);
        assert_eq!(breaker.snapshot().short_circuited, 1);
    }

    #[tokio::test]
    async fn test_stays_closed_below_volume() {
        let breaker = CircuitBreaker::new("intent", test_config());
        // 100% errors but under the volume threshold.
        for _ in 0..9 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("synth", test_config());
        for _ in 0..10 {
            let result: Result<u32, BreakerError<&'static str>> = breaker
                .call(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(1)
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Timeout)));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.snapshot().failures, 10);
    }

    #[tokio::test]
    async fn test_half_open_probes_then_close() {
        let breaker = CircuitBreaker::new("recognizer", test_config());
        for _ in 0..10 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(70)).await;
        // Exactly half_open_max_calls probes proceed; all succeed.
        for _ in 0..3 {
            assert!(ok_call(&breaker).await.is_ok());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("recognizer", test_config());
        for _ in 0..10 {
            let _ = failing_call(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let _ = failing_call(&breaker).await; // first probe fails
        assert_eq!(breaker.state(), BreakerState::Open);
        // And short-circuits again immediately.
        assert!(matches!(ok_call(&breaker).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_half_open_admission_bounded() {
        let breaker = CircuitBreaker::new("recognizer", test_config());
        for _ in 0..10 {
            let _ = failing_call(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        // Admit the probe budget without resolving state (successes < max
        // only when some calls are still pending; here they resolve
        // sequentially, so drive two probes then check the third).
        assert!(ok_call(&breaker).await.is_ok());
        assert!(ok_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(ok_call(&breaker).await.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
