//! Error types for the transport module.

use relaycast_resilience::CircuitOpenError;
use thiserror::Error;

/// Errors that can occur while managing or probing destinations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Destination URL does not parse or has no host.
    #[error("Invalid URL for '{name}': {reason}")]
    InvalidUrl { name: String, reason: String },

    /// Destination uses a protocol the encoder cannot publish to.
    #[error("Unsupported scheme '{scheme}' for '{name}'")]
    UnsupportedScheme { name: String, scheme: String },

    /// No port given and none is implied by the scheme.
    #[error("No port for '{name}'")]
    MissingPort { name: String },

    /// A target with the same name is already registered.
    #[error("Target '{0}' already exists")]
    DuplicateTarget(String),

    /// No target with this name.
    #[error("Unknown target '{0}'")]
    UnknownTarget(String),

    /// Every probe attempt failed.
    #[error("{host}:{port} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },

    /// Probing this endpoint is suspended.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The probe was cancelled.
    #[error("Probe cancelled")]
    Cancelled,
}
