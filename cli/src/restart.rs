//! Relaunch policy for mid-session failures.

use std::sync::Arc;
use std::time::Duration;

use relaycast_engine::PipelineError;
use relaycast_resilience::{AttemptError, CircuitBreaker, RetryError, RetryOptions};
use tracing::{info, warn};

use crate::config::RestartSettings;

/// What to do after a failure was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    Relaunch,

    /// Too many failures in a row; wait before the next trial.
    CoolDown(Duration),
}

/// Counts consecutive failures on a circuit breaker.
///
/// A failure is forgiven only once the relaunched pipeline has stayed up for
/// [`RestartSettings::stable_secs`], so a crash loop opens the breaker even
/// though each relaunch itself succeeds.
#[derive(Debug)]
pub struct RestartPolicy {
    breaker: Arc<CircuitBreaker>,
    settings: RestartSettings,
}

impl RestartPolicy {
    pub fn new(breaker: Arc<CircuitBreaker>, settings: RestartSettings) -> Self {
        Self { breaker, settings }
    }

    /// Count a failure and decide what to do about it.
    pub fn on_failure(&self) -> FailureVerdict {
        self.breaker.record_failure();
        if self.breaker.is_open() {
            let cooldown = self.breaker.config().open_duration;
            warn!(
                failures = self.breaker.failure_count(),
                cooldown_secs = cooldown.as_secs(),
                "Too many failures, pausing relaunch"
            );
            FailureVerdict::CoolDown(cooldown)
        } else {
            FailureVerdict::Relaunch
        }
    }

    /// The relaunched pipeline stayed up long enough; forget earlier failures.
    pub fn on_stable(&self) {
        if self.breaker.failure_count() > 0 {
            info!("Pipeline stable again");
        }
        self.breaker.record_success();
    }

    /// How long a relaunched pipeline must run before failures are forgiven.
    pub fn stable_period(&self) -> Duration {
        Duration::from_secs(self.settings.stable_secs)
    }

    /// Retry settings for one relaunch.
    pub fn retry_options(&self) -> RetryOptions<PipelineError> {
        RetryOptions {
            max_retries: self.settings.max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(20),
            ..RetryOptions::default()
        }
        .retry_if(|failure| failure.inner().map_or(true, PipelineError::is_retryable))
    }
}

/// Returns true if relaunching again cannot help, e.g. a bad configuration.
pub fn is_fatal(err: &RetryError<PipelineError>) -> bool {
    match err {
        RetryError::Cancelled => true,
        RetryError::Exhausted { failures, .. } => failures
            .last()
            .and_then(AttemptError::inner)
            .is_some_and(|e| !e.is_retryable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_resilience::ManualClock;

    fn policy(threshold: u32) -> (RestartPolicy, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let settings = RestartSettings {
            enabled: true,
            failure_threshold: threshold,
            cooldown_secs: 60,
            ..RestartSettings::default()
        };
        let breaker = Arc::new(CircuitBreaker::new(
            "pipeline:relaunch",
            settings.breaker_config(),
            clock.clone(),
        ));
        (RestartPolicy::new(breaker, settings), clock)
    }

    #[test]
    fn test_consecutive_failures_cool_down() {
        let (policy, clock) = policy(2);

        assert_eq!(policy.on_failure(), FailureVerdict::Relaunch);
        assert_eq!(
            policy.on_failure(),
            FailureVerdict::CoolDown(Duration::from_secs(60))
        );

        // After the cooldown one trial is allowed; failing it opens again.
        clock.advance(Duration::from_secs(61));
        assert!(!policy.breaker.is_open());
        assert_eq!(
            policy.on_failure(),
            FailureVerdict::CoolDown(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_stable_run_forgives_failures() {
        let (policy, _clock) = policy(2);

        assert_eq!(policy.on_failure(), FailureVerdict::Relaunch);
        policy.on_stable();
        assert_eq!(policy.on_failure(), FailureVerdict::Relaunch);
        policy.on_stable();
        assert_eq!(policy.on_failure(), FailureVerdict::Relaunch);
    }

    #[test]
    fn test_retry_options_skip_permanent_errors() {
        let (policy, _clock) = policy(3);
        let options = policy.retry_options();

        assert!(options.should_retry(&AttemptError::Failed(PipelineError::ConnectionLost(
            "reset".to_string()
        ))));
        assert!(!options.should_retry(&AttemptError::Failed(PipelineError::NotConfigured)));
        assert!(options.should_retry(&AttemptError::TimedOut(Duration::from_secs(20))));
    }

    #[test]
    fn test_fatal_relaunch_errors() {
        let permanent = RetryError::Exhausted {
            attempts: 1,
            failures: vec![AttemptError::Failed(PipelineError::NotConfigured)],
        };
        assert!(is_fatal(&permanent));

        let transient = RetryError::Exhausted {
            attempts: 3,
            failures: vec![AttemptError::TimedOut(Duration::from_secs(20))],
        };
        assert!(!is_fatal(&transient));
        assert!(is_fatal(&RetryError::<PipelineError>::Cancelled));
    }
}
