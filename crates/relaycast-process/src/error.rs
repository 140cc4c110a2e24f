//! Error types for the process module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while running the encoder subprocess.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No encoder executable at the configured or well-known locations.
    #[error("Encoder not found (searched: {})", display_paths(.searched))]
    EncoderNotFound { searched: Vec<PathBuf> },

    /// The operating system refused to start the process.
    #[error("Failed to launch {}: {source}", .path.display())]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The argument string could not be split.
    #[error("Invalid encoder arguments: {0}")]
    InvalidArguments(String),

    /// A frame of this size cannot be decoded.
    #[error("Invalid frame size {width}x{height}")]
    InvalidFrameSize { width: u32, height: u32 },

    /// IO error on one of the process streams.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }

    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
