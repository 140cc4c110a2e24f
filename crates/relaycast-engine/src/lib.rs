//! Pipeline orchestrator for relaycast.
//!
//! This crate drives one encoder process through the preview and streaming
//! states, wiring its frame and log streams to the preview sink, the
//! statistics aggregator and the event channel.

mod arguments;
mod error;
mod metrics;
mod orchestrator;
mod session;
mod sink;

pub use arguments::{ArgumentBuilder, ArgumentTemplates, TemplateArgumentBuilder};
pub use error::PipelineError;
pub use metrics::{Rates, StatisticsAggregator};
pub use orchestrator::{EngineOptions, PipelineStateMachine};
pub use sink::{DiscardSinkFactory, PreviewSinkFactory};

use std::sync::Arc;

use crossbeam_channel::Sender;
use relaycast_ipc::PipelineEvent;

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Create a state machine using [`ArgumentTemplates`] and the given sink factory.
pub fn create_pipeline(
    templates: ArgumentTemplates,
    sink_factory: Arc<dyn PreviewSinkFactory>,
    event_tx: Sender<PipelineEvent>,
) -> PipelineStateMachine {
    PipelineStateMachine::new(
        Arc::new(TemplateArgumentBuilder::new(templates)),
        sink_factory,
        event_tx,
    )
}
