//! Destination reachability probe.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use relaycast_resilience::{
    BreakerError, CancellationToken, CircuitBreakerRegistry, RetryError, RetryExecutor,
    RetryOptions,
};

use crate::error::TransportError;
use crate::target::{default_port, ResolvedTarget};
use crate::TransportResult;

/// Per-attempt connect timeout.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub attempts: u32,
    pub latency: Duration,
}

/// Checks that a destination accepts TCP connections before streaming to it.
///
/// Each endpoint gets its own breaker (`probe:<host>:<port>`) from the
/// injected registry, so a dead ingest server is not hammered on every start.
pub struct DestinationProber {
    registry: Arc<CircuitBreakerRegistry>,
    executor: RetryExecutor,
    options: RetryOptions<io::Error>,
}

impl DestinationProber {
    /// Create a prober with the network retry preset.
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        let mut options = RetryOptions::network();
        options.timeout = PROBE_CONNECT_TIMEOUT;

        Self {
            registry,
            executor: RetryExecutor::new(),
            options,
        }
    }

    /// Replace the retry options.
    pub fn with_options(mut self, options: RetryOptions<io::Error>) -> Self {
        self.options = options;
        self
    }

    /// Host and port a target publishes to.
    pub fn endpoint(target: &ResolvedTarget) -> TransportResult<(String, u16)> {
        let url = url::Url::parse(&target.url).map_err(|e| TransportError::InvalidUrl {
            name: target.name.clone(),
            reason: e.to_string(),
        })?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl {
                name: target.name.clone(),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let port = url
            .port()
            .or_else(|| default_port(url.scheme()))
            .ok_or_else(|| TransportError::MissingPort {
                name: target.name.clone(),
            })?;

        Ok((host, port))
    }

    /// Probe one destination.
    #[instrument(skip(self, target, cancel), fields(name = %target.name))]
    pub async fn probe(
        &self,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> TransportResult<ProbeReport> {
        let (host, port) = Self::endpoint(target)?;
        let breaker = self.registry.get_or_create(&format!("probe:{}:{}", host, port));
        let address = format!("{}:{}", host, port);

        let started = Instant::now();
        let mut attempts = 0u32;

        let result = breaker
            .execute_with_retry(&self.executor, &self.options, cancel, |attempt| {
                attempts = attempt;
                debug!(attempt, %address, "Probing destination");
                let address = address.clone();
                async move { TcpStream::connect(address).await.map(drop) }
            })
            .await;

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                info!(%host, port, attempts, latency_ms = latency.as_millis() as u64, "Destination reachable");
                Ok(ProbeReport {
                    name: target.name.clone(),
                    host,
                    port,
                    attempts,
                    latency,
                })
            }
            Err(BreakerError::Open(e)) => {
                warn!(%host, port, "Probe skipped, circuit open");
                Err(TransportError::CircuitOpen(e))
            }
            Err(BreakerError::Inner(RetryError::Cancelled)) => {
                debug!(%host, port, "Probe cancelled");
                Err(TransportError::Cancelled)
            }
            Err(BreakerError::Inner(e)) => {
                warn!(%host, port, "Destination unreachable: {}", e);
                Err(TransportError::Unreachable {
                    host,
                    port,
                    attempts,
                    reason: e
                        .last_failure()
                        .map_or_else(|| e.to_string(), |f| f.to_string()),
                })
            }
        }
    }

    /// Probe every target in order, returning each outcome.
    pub async fn probe_all(
        &self,
        targets: &[ResolvedTarget],
        cancel: &CancellationToken,
    ) -> Vec<(String, TransportResult<ProbeReport>)> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push((target.name.clone(), self.probe(target, cancel).await));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_ipc::StreamTarget;
    use relaycast_resilience::{CircuitBreakerConfig, SystemClock};
    use tokio::net::TcpListener;

    fn registry(threshold: u32) -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(60),
            },
            Arc::new(SystemClock),
        ))
    }

    fn fast_options() -> RetryOptions<io::Error> {
        let mut options = RetryOptions::network();
        options.initial_delay = Duration::from_millis(5);
        options.max_delay = Duration::from_millis(20);
        options.timeout = Duration::from_secs(1);
        options
    }

    fn target(url: &str) -> ResolvedTarget {
        ResolvedTarget::resolve(&StreamTarget::new("custom", "Local", url, "key")).unwrap()
    }

    #[test]
    fn test_endpoint_default_ports() {
        let (host, port) = DestinationProber::endpoint(&target("rtmp://live.example.com/app")).unwrap();
        assert_eq!(host, "live.example.com");
        assert_eq!(port, 1935);

        let (_, port) = DestinationProber::endpoint(&target("rtmps://live.example.com/app")).unwrap();
        assert_eq!(port, 443);

        let (_, port) = DestinationProber::endpoint(&target("rtmp://live.example.com:1940/app")).unwrap();
        assert_eq!(port, 1940);

        assert!(matches!(
            DestinationProber::endpoint(&target("srt://live.example.com/app")),
            Err(TransportError::MissingPort { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = DestinationProber::new(registry(3)).with_options(fast_options());
        let report = prober
            .probe(&target(&format!("rtmp://127.0.0.1:{}/live", port)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.port, port);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_opens_circuit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let registry = registry(1);
        let prober = DestinationProber::new(registry.clone()).with_options(fast_options());
        let dead = target(&format!("rtmp://127.0.0.1:{}/live", port));
        let cancel = CancellationToken::new();

        match prober.probe(&dead, &cancel).await {
            Err(TransportError::Unreachable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected unreachable, got {:?}", other),
        }

        assert!(matches!(
            prober.probe(&dead, &cancel).await,
            Err(TransportError::CircuitOpen(_))
        ));

        let key = format!("probe:127.0.0.1:{}", port);
        assert!(registry.get(&key).unwrap().is_open());
    }

    #[tokio::test]
    async fn test_cancelled_probe() {
        let prober = DestinationProber::new(registry(3)).with_options(fast_options());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            prober.probe(&target("rtmp://127.0.0.1:1/live"), &cancel).await,
            Err(TransportError::Cancelled)
        ));
    }
}
