//! Encoder executable lookup.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ProcessError;
use crate::ProcessResult;

/// File name of the bundled encoder.
#[cfg(windows)]
pub const ENCODER_BINARY: &str = "ffmpeg.exe";

/// File name of the bundled encoder.
#[cfg(not(windows))]
pub const ENCODER_BINARY: &str = "ffmpeg";

/// Resolve the encoder executable.
///
/// The configured path wins when it exists; otherwise the locations next to
/// the running executable are tried (`ffmpeg/<binary>`, then `<binary>`).
pub fn resolve_encoder(configured: Option<&Path>) -> ProcessResult<PathBuf> {
    let mut searched = Vec::new();

    if let Some(path) = configured.filter(|p| !p.as_os_str().is_empty()) {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        debug!(path = %path.display(), "Configured encoder path does not exist");
        searched.push(path.to_path_buf());
    }

    for candidate in well_known_locations() {
        if candidate.is_file() {
            debug!(path = %candidate.display(), "Using bundled encoder");
            return Ok(candidate);
        }
        searched.push(candidate);
    }

    Err(ProcessError::EncoderNotFound { searched })
}

fn well_known_locations() -> Vec<PathBuf> {
    let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    else {
        return Vec::new();
    };

    vec![
        dir.join("ffmpeg").join(ENCODER_BINARY),
        dir.join(ENCODER_BINARY),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_path() {
        let missing = Path::new("/definitely/not/here/ffmpeg");
        match resolve_encoder(Some(missing)) {
            Err(ProcessError::EncoderNotFound { searched }) => {
                assert_eq!(searched[0], missing);
                assert!(searched.len() >= 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_configured_path() {
        let sh = Path::new("/bin/sh");
        assert_eq!(resolve_encoder(Some(sh)).unwrap(), sh);
    }

    #[test]
    fn test_empty_configured_path_is_ignored() {
        if let Err(ProcessError::EncoderNotFound { searched }) =
            resolve_encoder(Some(Path::new("")))
        {
            assert!(searched.iter().all(|p| !p.as_os_str().is_empty()));
        }
    }
}
