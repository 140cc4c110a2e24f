//! Events sent from the engine to its frontends.

use serde::{Deserialize, Serialize};

use crate::state::{PipelineState, StopReason};
use crate::types::{LogLevel, PipelineStatistics};

/// Events that the pipeline publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Pipeline state has changed.
    StateChanged {
        /// Previous state.
        previous: PipelineState,

        /// Current state.
        current: PipelineState,
    },

    /// Updated throughput statistics.
    Statistics(PipelineStatistics),

    /// A classified line from the encoder's diagnostic stream.
    Log { level: LogLevel, line: String },

    /// A diagnostic line indicating the encoder cannot proceed.
    CriticalIssue { message: String },

    /// The encoder process ended.
    ProcessExited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,

        /// Whether the exit was asked for.
        requested: bool,

        /// What ended the session.
        reason: StopReason,
    },

    /// A mid-session failure, with a short user-facing message.
    Error { message: String },
}
