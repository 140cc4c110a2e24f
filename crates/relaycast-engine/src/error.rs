//! Error types for the pipeline engine.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;

use relaycast_ipc::ConfigError;
use relaycast_process::ProcessError;
use relaycast_resilience::{BreakerError, CircuitOpenError, RetryError};
use relaycast_transport::TransportError;

/// Errors surfaced by [`crate::PipelineStateMachine`].
///
/// `Display` carries the technical detail for the log; [`PipelineError::user_message`]
/// is what a user gets to see.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration was rejected before launch.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// No encoder executable could be found.
    #[error("Encoder not found (searched: {})", display_paths(.searched))]
    EncoderNotFound { searched: Vec<PathBuf> },

    /// The encoder process could not be started.
    #[error("Encoder launch failed: {0}")]
    ProcessLaunchFailed(#[source] ProcessError),

    /// The encoder died or reported an unrecoverable problem mid-session.
    #[error("Encoder crashed: {detail}")]
    ProcessCrashed { code: Option<i32>, detail: String },

    /// A broadcast destination became unreachable.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A stream was requested without any enabled destination.
    #[error("No active stream targets")]
    NoActiveTargets,

    /// A stream was requested before any configuration was given.
    #[error("Pipeline has no configuration")]
    NotConfigured,

    /// A destination is malformed.
    #[error("Invalid target: {0}")]
    InvalidTarget(#[from] TransportError),

    /// A retried operation failed on every attempt.
    #[error("Gave up after {attempts} attempt(s): {}", .failures.join("; "))]
    RetryExhausted { attempts: u32, failures: Vec<String> },

    /// A guarded operation was rejected without running.
    #[error("Circuit breaker '{key}' is open")]
    CircuitBreakerOpen {
        key: String,
        opened_at: Option<Instant>,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    OperationCancelled,
}

impl PipelineError {
    /// Short message suitable for display to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(ConfigError::InvalidDimensions { .. }) => {
                "The output resolution is not valid."
            }
            Self::ConfigInvalid(ConfigError::InvalidFrameRate) => "The frame rate is not valid.",
            Self::ConfigInvalid(ConfigError::InvalidRotation(_)) => {
                "Rotation must be 0, 90, 180 or 270 degrees."
            }
            Self::ConfigInvalid(_) => "The output settings are not valid.",
            Self::EncoderNotFound { .. } => {
                "The encoder could not be found. Check the encoder path in the settings."
            }
            Self::ProcessLaunchFailed(_) => "The encoder could not be started.",
            Self::ProcessCrashed { .. } => "The encoder stopped unexpectedly.",
            Self::ConnectionLost(_) => "The connection to a streaming destination was lost.",
            Self::NoActiveTargets => "Enable at least one streaming destination.",
            Self::NotConfigured => "Start the preview before going live.",
            Self::InvalidTarget(_) => "A streaming destination has an invalid address.",
            Self::RetryExhausted { .. } => "The operation failed after several attempts.",
            Self::CircuitBreakerOpen { .. } => {
                "Too many recent failures, please wait a moment before trying again."
            }
            Self::OperationCancelled => "The operation was cancelled.",
        }
    }

    /// Whether relaunching could help.
    ///
    /// Configuration and lookup problems fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProcessLaunchFailed(_) | Self::ProcessCrashed { .. } | Self::ConnectionLost(_)
        )
    }
}

impl From<ProcessError> for PipelineError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::EncoderNotFound { searched } => Self::EncoderNotFound { searched },
            other => Self::ProcessLaunchFailed(other),
        }
    }
}

impl From<CircuitOpenError> for PipelineError {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitBreakerOpen {
            key: err.key,
            opened_at: err.opened_at,
        }
    }
}

impl<E: fmt::Display> From<RetryError<E>> for PipelineError {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Cancelled => Self::OperationCancelled,
            RetryError::Exhausted { attempts, failures } => Self::RetryExhausted {
                attempts,
                failures: failures.iter().map(ToString::to_string).collect(),
            },
        }
    }
}

impl<E: Into<PipelineError>> From<BreakerError<E>> for PipelineError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open(open) => open.into(),
            BreakerError::Inner(inner) => inner.into(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_resilience::AttemptError;
    use std::time::Duration;

    #[test]
    fn test_process_errors_map_to_taxonomy() {
        let err: PipelineError = ProcessError::EncoderNotFound {
            searched: vec![PathBuf::from("/opt/ffmpeg")],
        }
        .into();
        assert!(matches!(err, PipelineError::EncoderNotFound { .. }));
        assert!(!err.is_retryable());

        let err: PipelineError = ProcessError::InvalidArguments("unterminated quote".into()).into();
        assert!(matches!(err, PipelineError::ProcessLaunchFailed(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_error_keeps_every_failure() {
        let err: PipelineError = RetryError::<String>::Exhausted {
            attempts: 2,
            failures: vec![
                AttemptError::Failed("refused".to_string()),
                AttemptError::TimedOut(Duration::from_secs(5)),
            ],
        }
        .into();

        match err {
            PipelineError::RetryExhausted { attempts, failures } => {
                assert_eq!(attempts, 2);
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0], "refused");
            }
            other => panic!("unexpected {:?}", other),
        }

        let err: PipelineError = RetryError::<String>::Cancelled.into();
        assert!(matches!(err, PipelineError::OperationCancelled));
    }

    #[test]
    fn test_breaker_error_conversion() {
        let open: BreakerError<RetryError<PipelineError>> = BreakerError::Open(CircuitOpenError {
            key: "pipeline:relaunch".to_string(),
            opened_at: None,
        });
        match PipelineError::from(open) {
            PipelineError::CircuitBreakerOpen { key, .. } => assert_eq!(key, "pipeline:relaunch"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_user_messages_hide_detail() {
        let err = PipelineError::ProcessCrashed {
            code: Some(1),
            detail: "rtmp://host/app/secret-key: Broken pipe".to_string(),
        };
        assert!(err.to_string().contains("Broken pipe"));
        assert!(!err.user_message().contains("secret-key"));
    }
}
