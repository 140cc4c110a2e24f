//! Broadcast destinations.

use std::fmt;

use tracing::{debug, info};
use url::Url;

use relaycast_ipc::StreamTarget;

use crate::error::TransportError;
use crate::TransportResult;

/// Schemes the encoder can publish to.
pub const SUPPORTED_SCHEMES: &[&str] = &["rtmp", "rtmps", "srt", "rtsp", "http", "https"];

const REDACTED: &str = "****";

/// Join a base ingest URL and a stream key.
///
/// The key is appended after a single `/`. An empty key, or one the base
/// already contains, leaves the base unchanged.
pub fn build_url(base: &str, stream_key: &str) -> String {
    if stream_key.is_empty() || base.contains(stream_key) {
        return base.to_string();
    }

    if base.ends_with('/') {
        format!("{}{}", base, stream_key)
    } else {
        format!("{}/{}", base, stream_key)
    }
}

/// Port implied by a scheme when the URL does not give one.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "rtmp" => Some(1935),
        "rtmps" | "https" => Some(443),
        "http" => Some(80),
        "rtsp" => Some(554),
        _ => None,
    }
}

/// Check that a target's base URL is something the encoder can publish to.
pub fn validate_target(target: &StreamTarget) -> TransportResult<Url> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        name: target.name.clone(),
        reason,
    };

    let url = Url::parse(target.url.trim()).map_err(|e| invalid(e.to_string()))?;

    if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
        return Err(TransportError::UnsupportedScheme {
            name: target.name.clone(),
            scheme: url.scheme().to_string(),
        });
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(url)
}

/// An active target reduced to what the encoder needs.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub platform: String,
    pub name: String,

    /// Final destination URL, stream key included.
    pub url: String,

    redacted: String,
}

impl ResolvedTarget {
    /// Resolve a target, validating its base URL.
    pub fn resolve(target: &StreamTarget) -> TransportResult<Self> {
        validate_target(target)?;

        let url = build_url(target.url.trim(), &target.stream_key);
        let redacted = if target.stream_key.is_empty() {
            url.clone()
        } else {
            url.replace(&target.stream_key, REDACTED)
        };

        Ok(Self {
            platform: target.platform.clone(),
            name: target.name.clone(),
            url,
            redacted,
        })
    }

    /// The URL with its stream key masked, for logs and UI.
    pub fn redacted_url(&self) -> &str {
        &self.redacted
    }
}

impl fmt::Debug for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTarget")
            .field("platform", &self.platform)
            .field("name", &self.name)
            .field("url", &self.redacted)
            .finish()
    }
}

/// The set of configured destinations, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: Vec<StreamTarget>,
}

impl TargetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting duplicate names and invalid URLs.
    pub fn from_targets(targets: impl IntoIterator<Item = StreamTarget>) -> TransportResult<Self> {
        let mut registry = Self::new();
        for target in targets {
            registry.add(target)?;
        }
        Ok(registry)
    }

    /// Add a target. Targets with an empty URL are kept but never active.
    pub fn add(&mut self, target: StreamTarget) -> TransportResult<()> {
        if self.position(&target.name).is_some() {
            return Err(TransportError::DuplicateTarget(target.name));
        }

        if !target.url.trim().is_empty() {
            validate_target(&target)?;
        }

        info!(
            name = %target.name,
            platform = %target.platform,
            enabled = target.enabled,
            "Target added"
        );
        self.targets.push(target);
        Ok(())
    }

    /// Remove a target by name, returning it.
    pub fn remove(&mut self, name: &str) -> Option<StreamTarget> {
        let index = self.position(name)?;
        debug!(name, "Target removed");
        Some(self.targets.remove(index))
    }

    /// Enable or disable a target by name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> TransportResult<()> {
        let index = self
            .position(name)
            .ok_or_else(|| TransportError::UnknownTarget(name.to_string()))?;
        self.targets[index].enabled = enabled;
        debug!(name, enabled, "Target toggled");
        Ok(())
    }

    /// Look up a target by name.
    pub fn get(&self, name: &str) -> Option<&StreamTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// All targets in insertion order.
    pub fn targets(&self) -> &[StreamTarget] {
        &self.targets
    }

    /// Targets that take part in the next stream.
    pub fn active(&self) -> impl Iterator<Item = &StreamTarget> {
        self.targets.iter().filter(|t| t.is_active())
    }

    /// Active targets with their final URLs. Empty if none is active.
    pub fn resolved(&self) -> TransportResult<Vec<ResolvedTarget>> {
        self.active().map(ResolvedTarget::resolve).collect()
    }

    /// Number of registered targets, enabled or not.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if no target is registered.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.targets.iter().position(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url() {
        assert_eq!(build_url("rtmp://host/app", "key123"), "rtmp://host/app/key123");
        assert_eq!(build_url("rtmp://host/app/", "key123"), "rtmp://host/app/key123");
        assert_eq!(
            build_url("rtmp://host/app/key123", "key123"),
            "rtmp://host/app/key123"
        );
        assert_eq!(build_url("srt://host:9000?streamid=x", ""), "srt://host:9000?streamid=x");
    }

    #[test]
    fn test_validate_target() {
        let ok = StreamTarget::new("twitch", "Twitch", "rtmp://live.twitch.tv/app", "k");
        assert_eq!(validate_target(&ok).unwrap().host_str(), Some("live.twitch.tv"));

        let bad_scheme = StreamTarget::new("custom", "Ftp", "ftp://example.com/live", "k");
        assert!(matches!(
            validate_target(&bad_scheme),
            Err(TransportError::UnsupportedScheme { .. })
        ));

        let garbage = StreamTarget::new("custom", "Garbage", "not a url", "k");
        assert!(matches!(
            validate_target(&garbage),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_resolved_target_masks_key() {
        let target = StreamTarget::new("youtube", "YouTube", "rtmp://a.rtmp.youtube.com/live2", "abcd-1234");
        let resolved = ResolvedTarget::resolve(&target).unwrap();

        assert_eq!(resolved.url, "rtmp://a.rtmp.youtube.com/live2/abcd-1234");
        assert_eq!(resolved.redacted_url(), "rtmp://a.rtmp.youtube.com/live2/****");
        assert!(!format!("{:?}", resolved).contains("abcd-1234"));
    }

    #[test]
    fn test_registry_active_filtering() {
        let mut disabled = StreamTarget::new("custom", "Backup", "rtmp://backup/live", "backup-key");
        disabled.enabled = false;
        let blank = StreamTarget::new("custom", "Blank", "", "");

        let mut registry = TargetRegistry::from_targets([
            StreamTarget::new("twitch", "Twitch", "rtmp://live.twitch.tv/app", "twitch-key"),
            disabled,
            blank,
        ])
        .unwrap();

        assert_eq!(registry.len(), 3);
        let names: Vec<_> = registry.active().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Twitch"]);

        registry.set_enabled("Backup", true).unwrap();
        let resolved = registry.resolved().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].url, "rtmp://live.twitch.tv/app/twitch-key");
        assert_eq!(resolved[1].url, "rtmp://backup/live/backup-key");

        registry.set_enabled("Twitch", false).unwrap();
        registry.set_enabled("Backup", false).unwrap();
        assert!(registry.resolved().unwrap().is_empty());
    }

    #[test]
    fn test_key_already_in_base_is_not_appended() {
        // A short key can occur anywhere in the base, not only at its end.
        let registry = TargetRegistry::from_targets([
            StreamTarget::new("custom", "Embedded", "rtmp://host/app/live_42", "live_42"),
            StreamTarget::new("custom", "Short", "rtmp://backup/live", "b"),
        ])
        .unwrap();

        let resolved = registry.resolved().unwrap();
        assert_eq!(resolved[0].url, "rtmp://host/app/live_42");
        assert_eq!(resolved[1].url, "rtmp://backup/live");
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_names() {
        let mut registry = TargetRegistry::new();
        registry
            .add(StreamTarget::new("custom", "Main", "rtmp://a/live", "k"))
            .unwrap();

        assert!(matches!(
            registry.add(StreamTarget::new("custom", "Main", "rtmp://b/live", "k")),
            Err(TransportError::DuplicateTarget(_))
        ));
        assert!(matches!(
            registry.set_enabled("Missing", true),
            Err(TransportError::UnknownTarget(_))
        ));

        assert!(registry.remove("Main").is_some());
        assert!(registry.is_empty());
    }
}
