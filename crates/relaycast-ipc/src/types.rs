//! Common types shared between the engine and its frontends.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::PipelineState;

/// Bytes per pixel of the raw preview stream (packed BGR24).
pub const BYTES_PER_PIXEL: usize = 3;

/// Rotations the encoder can apply to the capture.
pub const VALID_ROTATIONS: [u32; 4] = [0, 90, 180, 270];

/// Reasons a [`PipelineConfig`] is rejected before launch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Width or height is zero.
    #[error("Output dimensions must be positive (got {width}x{height})")]
    InvalidDimensions { width: u32, height: u32 },

    /// Frame rate is zero.
    #[error("Frame rate must be positive")]
    InvalidFrameRate,

    /// Rotation is not a quarter turn.
    #[error("Rotation must be one of 0, 90, 180, 270 (got {0})")]
    InvalidRotation(u32),

    /// Video bitrate is zero.
    #[error("Video bitrate must be positive")]
    InvalidBitrate,

    /// A frame would not fit in memory.
    #[error("Frame size {width}x{height} overflows")]
    FrameTooLarge { width: u32, height: u32 },
}

/// Configuration for one pipeline session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture source identifier (device name, screen id, file...).
    pub capture_source: String,

    /// Output width in pixels.
    pub width: u32,

    /// Output height in pixels.
    pub height: u32,

    /// Output frames per second.
    pub fps: u32,

    /// Rotation in degrees.
    pub rotation: u32,

    /// Path to the encoder executable. `None` falls back to well-known locations.
    pub encoder_path: Option<PathBuf>,

    /// Audio source identifier.
    pub audio_source: String,

    /// Video bitrate in kbps.
    pub video_bitrate_kbps: u32,

    /// Audio bitrate in kbps.
    pub audio_bitrate_kbps: u32,

    /// Encoder name (e.g. "libx264", "h264_nvenc").
    pub encoder: String,

    /// Encoder preset.
    pub preset: String,

    /// Optional named pipe carrying an overlay image stream.
    pub overlay_pipe: Option<String>,

    /// Whether the encoder emits raw frames for local preview.
    pub preview_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_source: String::new(),
            width: 1280,
            height: 720,
            fps: 30,
            rotation: 0,
            encoder_path: None,
            audio_source: String::new(),
            video_bitrate_kbps: 4500,
            audio_bitrate_kbps: 160,
            encoder: "libx264".to_string(),
            preset: "veryfast".to_string(),
            overlay_pipe: None,
            preview_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// Check the configuration before any process is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }

        if self.fps == 0 {
            return Err(ConfigError::InvalidFrameRate);
        }

        if !VALID_ROTATIONS.contains(&self.rotation) {
            return Err(ConfigError::InvalidRotation(self.rotation));
        }

        if self.video_bitrate_kbps == 0 {
            return Err(ConfigError::InvalidBitrate);
        }

        if self.checked_frame_size().is_none() {
            return Err(ConfigError::FrameTooLarge {
                width: self.width,
                height: self.height,
            });
        }

        Ok(())
    }

    /// Size in bytes of one raw preview frame.
    pub fn frame_size(&self) -> usize {
        self.checked_frame_size().unwrap_or(0)
    }

    fn checked_frame_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(BYTES_PER_PIXEL)
    }
}

/// A network broadcast destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTarget {
    /// Platform tag ("twitch", "youtube", "custom"...).
    pub platform: String,

    /// Display name, unique within a registry.
    pub name: String,

    /// Base ingest URL.
    pub url: String,

    /// Stream key appended to the URL.
    pub stream_key: String,

    /// Whether this destination takes part in the next stream.
    pub enabled: bool,
}

impl Default for StreamTarget {
    fn default() -> Self {
        Self {
            platform: "custom".to_string(),
            name: String::new(),
            url: String::new(),
            stream_key: String::new(),
            enabled: true,
        }
    }
}

impl StreamTarget {
    /// Create an enabled target.
    pub fn new(
        platform: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        stream_key: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            name: name.into(),
            url: url.into(),
            stream_key: stream_key.into(),
            enabled: true,
        }
    }

    /// A target takes part in a stream only when enabled and addressable.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.url.trim().is_empty()
    }
}

/// Severity of an encoder diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Progress reported by the encoder on its diagnostic stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderProgress {
    /// Frames the encoder has produced.
    pub frame: u64,

    /// Instantaneous frame rate reported by the encoder.
    pub fps: f64,

    /// Output bitrate in kbit/s, when known.
    pub bitrate_kbps: Option<f64>,

    /// Output size in KB, when known.
    pub size_kb: Option<u64>,
}

/// Snapshot of pipeline throughput.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatistics {
    /// Preview frames decoded since the last (re)start.
    pub frames_received: u64,

    /// Frames per second since the last (re)start.
    pub fps: f64,

    /// Preview bytes decoded since the last (re)start.
    pub bytes_received: u64,

    /// Preview bitrate in kbps since the last (re)start.
    pub bitrate_kbps: f64,

    /// Time since the last (re)start.
    pub uptime: Duration,

    /// State at snapshot time.
    pub state: PipelineState,

    /// Latest progress line from the encoder.
    pub encoder: Option<EncoderProgress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = PipelineConfig {
            width: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDimensions { width: 0, .. })
        ));

        let config = PipelineConfig {
            fps: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidFrameRate));

        let config = PipelineConfig {
            rotation: 45,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRotation(45)));
    }

    #[test]
    fn test_frame_size() {
        let config = PipelineConfig {
            width: 4,
            height: 2,
            ..Default::default()
        };
        assert_eq!(config.frame_size(), 24);
    }

    #[test]
    fn test_target_active() {
        let mut target = StreamTarget::new("twitch", "main", "rtmp://live.twitch.tv/app", "k");
        assert!(target.is_active());

        target.enabled = false;
        assert!(!target.is_active());

        target.enabled = true;
        target.url = "  ".to_string();
        assert!(!target.is_active());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "width": 640, "height": 360 }"#).unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.fps, 30);
        assert!(config.preview_enabled);
    }
}
