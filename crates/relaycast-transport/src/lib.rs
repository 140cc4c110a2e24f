//! Broadcast destinations.
//!
//! This crate holds the configured stream targets, turns them into the final
//! publish URLs handed to the encoder, and probes their reachability through
//! the resilience layer.

mod error;
mod probe;
mod target;

pub use error::TransportError;
pub use probe::{DestinationProber, ProbeReport, PROBE_CONNECT_TIMEOUT};
pub use target::{
    build_url, default_port, validate_target, ResolvedTarget, TargetRegistry, SUPPORTED_SCHEMES,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
