//! Per-operation circuit breaker.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::{BreakerError, CircuitOpenError, RetryError};
use crate::retry::{RetryExecutor, RetryOptions};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a trial call.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

#[derive(Debug, Default)]
struct BreakerInner {
    failures: u32,
    opened_at: Option<Instant>,
    half_open: bool,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

/// Counts consecutive failures of one operation class and fails fast once
/// they reach the threshold.
///
/// The open state is evaluated lazily: the first read after `open_duration`
/// has elapsed clears the stamp and presets the counter to `threshold - 1`,
/// so one further failure opens the breaker again (half-open). While
/// half-open, [`CircuitBreaker::execute`] admits a single trial call at a
/// time.
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            key: key.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// Operation key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Effective configuration.
    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Reset the counter and close the breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.opened_at.is_some() || inner.half_open {
            info!(key = %self.key, "Circuit breaker closed");
        }
        inner.failures = 0;
        inner.opened_at = None;
        inner.half_open = false;
        inner.trial_in_flight = false;
        inner.total_successes += 1;
    }

    /// Count a failure, opening the breaker at the threshold.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.total_failures += 1;
        inner.trial_in_flight = false;

        if inner.failures >= self.config.failure_threshold && inner.opened_at.is_none() {
            inner.opened_at = Some(now);
            inner.half_open = false;
            warn!(
                key = %self.key,
                failures = inner.failures,
                open_for = ?self.config.open_duration,
                "Circuit breaker opened"
            );
        }
    }

    /// Whether calls are currently rejected.
    pub fn is_open(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)
    }

    /// Current state, applying the lazy half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if self.refresh(&mut inner) {
            CircuitState::Open
        } else if inner.half_open {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    /// When the breaker opened, if it is open.
    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Counters and state for monitoring.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitBreakerStats {
            key: self.key.clone(),
            state,
            failure_count: inner.failures,
            opened_at: inner.opened_at,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Run `operation` unless the breaker is open, recording its outcome.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Run `operation` through `executor` unless the breaker is open.
    ///
    /// The whole retry sequence counts as one outcome. A caller cancellation
    /// is neither a success nor a failure.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        executor: &RetryExecutor,
        options: &RetryOptions<E>,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, BreakerError<RetryError<E>>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;

        match executor.execute(options, cancel, operation).await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(RetryError::Cancelled) => {
                debug!(key = %self.key, "Guarded operation cancelled");
                Err(BreakerError::Inner(RetryError::Cancelled))
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();

        if self.refresh(&mut inner) {
            inner.rejected_calls += 1;
            return Err(CircuitOpenError {
                key: self.key.clone(),
                opened_at: inner.opened_at,
            });
        }

        let trial = inner.half_open;
        if trial {
            if inner.trial_in_flight {
                inner.rejected_calls += 1;
                debug!(key = %self.key, "Half-open trial already in flight");
                return Err(CircuitOpenError {
                    key: self.key.clone(),
                    opened_at: None,
                });
            }
            inner.trial_in_flight = true;
        }

        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn refresh(&self, inner: &mut BreakerInner) -> bool {
        let Some(opened_at) = inner.opened_at else {
            return false;
        };

        if self.clock.now().saturating_duration_since(opened_at) < self.config.open_duration {
            return true;
        }

        inner.opened_at = None;
        inner.failures = self.config.failure_threshold - 1;
        inner.half_open = true;
        inner.trial_in_flight = false;
        info!(key = %self.key, "Circuit breaker half-open");
        false
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Releases a half-open trial slot if the guarded call is dropped unfinished.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn breaker(threshold: u32, open_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(open_secs),
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn test_opens_at_threshold() {
        let (breaker, _clock) = breaker(3, 10);

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(breaker.opened_at().is_some());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_duration() {
        let (breaker, clock) = breaker(3, 10);
        for _ in 0..3 {
            breaker.record_failure();
        }

        clock.advance(Duration::from_secs(9));
        assert!(breaker.is_open());

        clock.advance(Duration::from_secs(1));
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 2);
        assert_eq!(breaker.opened_at(), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets() {
        let (breaker, clock) = breaker(2, 5);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(5));
        assert!(!breaker.is_open());

        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_execute_fails_fast_when_open() {
        let (breaker, _clock) = breaker(1, 60);

        let result: Result<(), _> = breaker.execute(|| async { Err("boom") }).await;
        assert!(matches!(result, Err(BreakerError::Inner("boom"))));

        let mut ran = false;
        let result: Result<(), BreakerError<&str>> = breaker
            .execute(|| {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert!(!ran);
        match result {
            Err(BreakerError::Open(e)) => {
                assert_eq!(e.key, "test");
                assert!(e.opened_at.is_some());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(breaker.stats().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_single_trial_while_half_open() {
        let (breaker, clock) = breaker(1, 1);
        breaker.record_failure();
        clock.advance(Duration::from_secs(1));

        let first = breaker.acquire().expect("trial admitted");
        assert!(breaker.acquire().is_err());

        first.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.acquire().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_trial_releases_slot() {
        let (breaker, clock) = breaker(1, 1);
        breaker.record_failure();
        clock.advance(Duration::from_secs(1));

        drop(breaker.acquire().expect("trial admitted"));
        assert!(breaker.acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_counts_one_outcome() {
        let (breaker, _clock) = breaker(2, 60);
        let executor = RetryExecutor::with_random(|| 0.0);
        let options = RetryOptions::<String> {
            max_retries: 3,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let result: Result<(), _> = breaker
            .execute_with_retry(&executor, &options, &cancel, |_| async {
                Err("down".to_string())
            })
            .await;

        assert!(matches!(
            result,
            Err(BreakerError::Inner(RetryError::Exhausted { attempts: 3, .. }))
        ));
        assert_eq!(breaker.failure_count(), 1);
        assert!(!breaker.is_open());
    }
}
