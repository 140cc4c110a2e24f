//! Pipeline state machine types.

use serde::{Deserialize, Serialize};

/// The current state of a pipeline.
///
/// ```text
/// Stopped ──StartPreview──▶ Starting ──▶ PreviewOnly ──StartStream──▶ Stopping ──▶ Starting ──▶ Streaming
///                              │                                                              │
///                              └──▶ Error ◀── crash / critical log ─────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PipelineState {
    /// No encoder process.
    #[default]
    Stopped = 0,

    /// Encoder is being launched.
    Starting = 1,

    /// Encoder emits preview frames only.
    PreviewOnly = 2,

    /// Encoder emits preview frames and feeds every active destination.
    Streaming = 3,

    /// Encoder is being shut down.
    Stopping = 4,

    /// Encoder failed to launch or died mid-session.
    Error = 5,
}

impl PipelineState {
    /// Decode a value stored with `as u8`. Unknown values map to `Error`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Starting,
            2 => Self::PreviewOnly,
            3 => Self::Streaming,
            4 => Self::Stopping,
            _ => Self::Error,
        }
    }

    /// Returns true while an encoder process is live.
    pub fn is_running(self) -> bool {
        matches!(self, Self::PreviewOnly | Self::Streaming)
    }

    /// Returns true if a `Start*` call may launch from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Returns true while a transition is in progress.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::PreviewOnly => "PreviewOnly",
            Self::Streaming => "Streaming",
            Self::Stopping => "Stopping",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why the encoder of a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Caller asked for it.
    UserRequested,

    /// Relaunch with a different output set.
    Reconfigure,

    /// Encoder exited on its own.
    ProcessExited { code: Option<i32> },

    /// A diagnostic line signalled that the encoder cannot proceed.
    CriticalIssue { message: String },

    /// A broadcast destination became unreachable.
    ConnectionLost { message: String },
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Stopped by user".to_string(),
            Self::Reconfigure => "Restarting encoder".to_string(),
            Self::ProcessExited { code: Some(code) } => {
                format!("Encoder exited with code {code}")
            }
            Self::ProcessExited { code: None } => "Encoder was terminated".to_string(),
            Self::CriticalIssue { message } => format!("Encoder error: {message}"),
            Self::ConnectionLost { message } => format!("Connection lost: {message}"),
        }
    }
}
