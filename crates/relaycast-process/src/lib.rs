//! Encoder subprocess supervision.
//!
//! This crate launches the external encoder, decodes the raw frame protocol
//! on its primary output, and classifies its diagnostic stream. It knows
//! nothing about pipeline states; the engine drives it.

mod args;
mod error;
mod frame;
mod log;
mod progress;
mod resolve;
mod supervisor;

pub use args::split_arguments;
pub use error::ProcessError;
pub use frame::{FrameChannel, FrameChannelEnd, FrameChannelSummary, FrameCounters, FrameSink};
pub use log::{
    classify_line, detect_critical, CriticalIssue, CriticalKind, LogChannel, LogChannelSummary,
    LogHandler, CRITICAL_PATTERNS, MAX_LINE_LENGTH,
};
pub use progress::parse_progress;
pub use resolve::{resolve_encoder, ENCODER_BINARY};
pub use supervisor::{ProcessExit, ProcessSupervisor, SupervisorOptions, QUIT_SIGNAL};

use std::time::Duration;

/// Default wait for a graceful exit after the quit signal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Default bounded wait for each stream reader on stop.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames between statistics snapshots.
pub const DEFAULT_STATISTICS_CADENCE: u64 = 30;

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;
