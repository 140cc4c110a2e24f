//! Retry with backoff and per-operation circuit breaking.
//!
//! Network-facing parts of relaycast (destination probes, platform API calls)
//! and callers deciding whether to relaunch a failed pipeline run their
//! operations through a [`RetryExecutor`] and a [`CircuitBreaker`] taken from
//! an explicitly constructed [`CircuitBreakerRegistry`].

mod circuit_breaker;
mod clock;
mod error;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{AttemptError, BreakerError, CircuitOpenError, RetryError};
pub use registry::CircuitBreakerRegistry;
pub use retry::{
    Backoff, NetworkFailure, RetryExecutor, RetryOptions, RetryPredicate, StatusExtractor,
    NETWORK_RETRYABLE_STATUS,
};

pub use tokio_util::sync::CancellationToken;
