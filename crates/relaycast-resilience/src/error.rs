//! Error types for the resilience module.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    /// The operation returned an error.
    #[error("{0}")]
    Failed(E),

    /// The operation did not finish within the per-attempt timeout.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> AttemptError<E> {
    /// Returns the operation's own error, if it produced one.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Failed(e) => Some(e),
            Self::TimedOut(_) => None,
        }
    }

    /// Returns true if the attempt hit its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// Errors raised by [`crate::RetryExecutor`].
///
/// The per-attempt failures are kept on the value; the message carries only
/// the count.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed, or a failure was not retryable.
    #[error("Operation failed after {attempts} attempt(s)")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,

        /// Every attempt's failure, oldest first.
        failures: Vec<AttemptError<E>>,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The most recent failure.
    pub fn last_failure(&self) -> Option<&AttemptError<E>> {
        match self {
            Self::Exhausted { failures, .. } => failures.last(),
            Self::Cancelled => None,
        }
    }

    /// Returns true if the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A call was rejected because its circuit breaker is open.
#[derive(Debug, Clone, Error)]
#[error("Circuit breaker '{key}' is open")]
pub struct CircuitOpenError {
    /// Operation key of the breaker.
    pub key: String,

    /// When the breaker opened. `None` while a half-open trial is in flight.
    pub opened_at: Option<Instant>,
}

/// Errors raised by [`crate::CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("{0}")]
    Open(#[from] CircuitOpenError),

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}
