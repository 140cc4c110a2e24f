//! Timed retry with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AttemptError, RetryError};

/// HTTP-style status codes the network preset treats as transient.
pub const NETWORK_RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate<E> = Arc<dyn Fn(&AttemptError<E>) -> bool + Send + Sync>;

/// Reads the status code out of an operation's error.
pub type StatusExtractor<E> = fn(&E) -> Option<u16>;

/// Errors that can describe themselves as transient network failures.
pub trait NetworkFailure {
    /// Status code carried by the failure, if it came from a request/response protocol.
    fn status_code(&self) -> Option<u16> {
        None
    }

    /// Connection refused/reset/timed out and similar.
    fn is_transient_network(&self) -> bool;
}

impl NetworkFailure for std::io::Error {
    fn is_transient_network(&self) -> bool {
        use std::io::ErrorKind;

        matches!(
            self.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::AddrNotAvailable
                | ErrorKind::Interrupted
        )
    }
}

/// Per-call retry settings.
pub struct RetryOptions<E> {
    /// Total number of attempts, including the first.
    pub max_retries: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Growth factor applied after every retry. Values below 1 are treated as 1.
    pub backoff_multiplier: f64,

    /// Fraction of the delay added as random jitter (0.0 to 1.0).
    pub jitter_factor: f64,

    /// Per-attempt timeout.
    pub timeout: Duration,

    /// Retryability predicate. `None` retries every failure.
    pub retry_if: Option<RetryPredicate<E>>,

    /// Status codes that are always retried, matched through `status_code`.
    pub retryable_status_codes: Vec<u16>,

    /// How to read a status code from a failure. `None` disables code matching.
    pub status_code: Option<StatusExtractor<E>>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            timeout: Duration::from_secs(30),
            retry_if: None,
            retryable_status_codes: Vec::new(),
            status_code: None,
        }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
            timeout: self.timeout,
            retry_if: self.retry_if.clone(),
            retryable_status_codes: self.retryable_status_codes.clone(),
            status_code: self.status_code,
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_factor", &self.jitter_factor)
            .field("timeout", &self.timeout)
            .field("retry_if", &self.retry_if.is_some())
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("status_code", &self.status_code.is_some())
            .finish()
    }
}

impl<E> RetryOptions<E> {
    /// Two fast attempts for cheap local operations.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Many attempts with a long cap, for operations that must eventually land.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Replace the retryability predicate.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&AttemptError<E>) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Whether `failure` may be retried.
    ///
    /// A status code listed in `retryable_status_codes` is retried regardless
    /// of the predicate.
    pub fn should_retry(&self, failure: &AttemptError<E>) -> bool {
        if let (AttemptError::Failed(e), Some(status_of)) = (failure, self.status_code) {
            if status_of(e).is_some_and(|code| self.retryable_status_codes.contains(&code)) {
                return true;
            }
        }

        match &self.retry_if {
            Some(predicate) => predicate(failure),
            None => true,
        }
    }

    /// Delay sequence without jitter.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            current: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
            multiplier: self.backoff_multiplier,
        }
    }

    fn with_jitter(&self, delay: Duration, random: f64) -> Duration {
        let factor = self.jitter_factor.clamp(0.0, 1.0) * random.clamp(0.0, 1.0);
        delay.saturating_add(delay.mul_f64(factor))
    }
}

impl<E: NetworkFailure + 'static> RetryOptions<E> {
    /// Retries connection failures, timeouts and [`NETWORK_RETRYABLE_STATUS`].
    pub fn network() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            retryable_status_codes: NETWORK_RETRYABLE_STATUS.to_vec(),
            status_code: Some(|e: &E| e.status_code()),
            ..Self::default()
        }
        .retry_if(|failure| match failure {
            AttemptError::TimedOut(_) => true,
            AttemptError::Failed(e) => e.is_transient_network(),
        })
    }
}

/// Bounded exponential delay sequence: `d(n+1) = min(d(n) * multiplier, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    fn grow(&self) -> Duration {
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };

        Duration::try_from_secs_f64(self.current.as_secs_f64() * multiplier)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current;
        self.current = self.grow();
        Some(delay)
    }
}

/// Runs operations under a [`RetryOptions`] policy.
#[derive(Clone)]
pub struct RetryExecutor {
    random: Arc<dyn Fn() -> f64 + Send + Sync>,
}

impl RetryExecutor {
    /// Create an executor drawing jitter from the thread RNG.
    pub fn new() -> Self {
        Self {
            random: Arc::new(rand::random::<f64>),
        }
    }

    /// Create an executor with a custom jitter source returning values in `[0, 1)`.
    pub fn with_random<R>(random: R) -> Self
    where
        R: Fn() -> f64 + Send + Sync + 'static,
    {
        Self {
            random: Arc::new(random),
        }
    }

    /// Run `operation` until it succeeds, the budget runs out, or `cancel` fires.
    ///
    /// The operation receives the 1-based attempt number. Each attempt races its
    /// own timeout and `cancel`; a caller cancellation is never retried.
    pub async fn execute<T, E, F, Fut>(
        &self,
        options: &RetryOptions<E>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = options.max_retries.max(1);
        let mut backoff = options.backoff();
        let mut failures = Vec::new();
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                debug!(attempt, "Operation cancelled before attempt");
                return Err(RetryError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt, "Operation cancelled during attempt");
                    return Err(RetryError::Cancelled);
                }
                result = tokio::time::timeout(options.timeout, operation(attempt)) => result,
            };

            let failure = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => AttemptError::Failed(e),
                Err(_) => AttemptError::TimedOut(options.timeout),
            };

            let retryable = options.should_retry(&failure);
            debug!(attempt, retryable, "Attempt failed: {}", failure);
            failures.push(failure);

            if !retryable || attempt >= max_attempts {
                warn!(attempts = attempt, retryable, "Giving up on operation");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    failures,
                });
            }

            let base = backoff.next().unwrap_or(options.max_delay);
            let delay = options.with_jitter(base, (self.random)());
            debug!(attempt, ?delay, "Backing off before retry");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt, "Operation cancelled during backoff");
                    return Err(RetryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor").finish_non_exhaustive()
    }
}
