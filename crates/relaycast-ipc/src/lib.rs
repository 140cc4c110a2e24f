//! Typed engine<->frontend data for the relaycast pipeline.
//!
//! This crate defines the configuration, state and event types exchanged
//! between the pipeline engine and whatever drives it (CLI, GUI shell).

mod events;
mod state;
mod types;

pub use events::PipelineEvent;
pub use state::{PipelineState, StopReason};
pub use types::{
    ConfigError, EncoderProgress, LogLevel, PipelineConfig, PipelineStatistics, StreamTarget,
    BYTES_PER_PIXEL, VALID_ROTATIONS,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (Engine → frontend).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<PipelineEvent>, Receiver<PipelineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
