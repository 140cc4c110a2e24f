//! Configuration file.

use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use relaycast_engine::ArgumentTemplates;
use relaycast_ipc::{PipelineConfig, StreamTarget};
use relaycast_resilience::{CircuitBreakerConfig, RetryOptions};

/// Contents of `relaycast.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub targets: Vec<StreamTarget>,
    pub arguments: ArgumentTemplates,
    pub probe: ProbeSettings,
    pub restart: RestartSettings,
}

impl AppConfig {
    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

/// Named retry presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPreset {
    Quick,
    #[default]
    Network,
    Default,
    Aggressive,
}

impl RetryPreset {
    /// Retry options for destination probes.
    pub fn probe_options(self) -> RetryOptions<io::Error> {
        match self {
            Self::Quick => RetryOptions::quick(),
            Self::Network => RetryOptions::network(),
            Self::Default => RetryOptions::default(),
            Self::Aggressive => RetryOptions::aggressive(),
        }
    }
}

/// Destination probing before going live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub enabled: bool,
    pub retry: RetryPreset,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            retry: RetryPreset::Network,
        }
    }
}

/// Relaunching after a mid-session failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub enabled: bool,

    /// Consecutive failures after which relaunching pauses.
    pub failure_threshold: u32,

    /// Length of that pause. One trial relaunch follows it.
    pub cooldown_secs: u64,

    /// Uptime after a relaunch that resets the failure count.
    pub stable_secs: u64,

    /// Launch attempts per relaunch.
    pub max_attempts: u32,
}

impl RestartSettings {
    /// Breaker settings for the relaunch policy.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_secs(self.cooldown_secs),
        }
    }
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 3,
            cooldown_secs: 60,
            stable_secs: 30,
            max_attempts: 3,
        }
    }
}
