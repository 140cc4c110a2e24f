mod config;
mod restart;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relaycast_engine::{
    create_pipeline, DiscardSinkFactory, PipelineError, PipelineStateMachine,
};
use relaycast_ipc::{event_channel, PipelineEvent};
use relaycast_resilience::{CancellationToken, CircuitBreakerRegistry, RetryError, RetryExecutor};
use relaycast_transport::{DestinationProber, TargetRegistry};

use crate::config::AppConfig;
use crate::restart::{is_fatal, FailureVerdict, RestartPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "relaycast.json")]
    config: PathBuf,

    /// Go live to the enabled targets after preview starts
    #[arg(short, long)]
    stream: bool,

    /// Probe destinations before going live
    #[arg(long)]
    probe: bool,

    /// Relaunch the pipeline after mid-session failures
    #[arg(long)]
    restart: bool,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log: Option<String>,
}

fn init_logging(directive: Option<&str>) {
    let filter = match directive {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "relaycast=info,relaycast_engine=debug,relaycast_process=info,relaycast_transport=info",
            )
        }),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// Drain engine events on a blocking thread, forwarding failures.
fn spawn_event_pump(
    events: Receiver<PipelineEvent>,
    failures: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || loop {
        if cancel.is_cancelled() {
            break;
        }
        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            PipelineEvent::StateChanged { previous, current } => {
                info!(%previous, %current, "Pipeline state changed");
            }
            PipelineEvent::Statistics(stats) => {
                info!(
                    frames = stats.frames_received,
                    fps = format!("{:.1}", stats.fps),
                    bitrate_kbps = format!("{:.0}", stats.bitrate_kbps),
                    uptime_secs = stats.uptime.as_secs(),
                    "Statistics"
                );
            }
            // Already traced under relaycast::encoder.
            PipelineEvent::Log { .. } => {}
            PipelineEvent::CriticalIssue { message } => {
                warn!("Critical encoder issue: {}", message);
            }
            PipelineEvent::ProcessExited {
                code,
                requested,
                reason,
            } => {
                debug!(?code, requested, reason = %reason.message(), "Encoder exited");
            }
            PipelineEvent::Error { message } => {
                error!("{}", message);
                if failures.send(message).is_err() {
                    break;
                }
            }
        }
    })
}

async fn probe_targets(
    targets: &TargetRegistry,
    config: &AppConfig,
    registry: Arc<CircuitBreakerRegistry>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let resolved = targets.resolved()?;
    let prober = DestinationProber::new(registry).with_options(config.probe.retry.probe_options());

    let mut unreachable = Vec::new();
    for (name, outcome) in prober.probe_all(&resolved, cancel).await {
        match outcome {
            Ok(report) => info!(
                name = %report.name,
                latency_ms = report.latency.as_millis() as u64,
                "Destination ready"
            ),
            Err(e) => {
                warn!(%name, "Destination check failed: {}", e);
                unreachable.push(name);
            }
        }
    }

    if !unreachable.is_empty() && unreachable.len() == resolved.len() {
        anyhow::bail!("No destination is reachable: {}", unreachable.join(", "));
    }
    Ok(())
}

/// Relaunch the previous mode once, retrying launch failures.
async fn relaunch(
    pipeline: &Arc<PipelineStateMachine>,
    config: &AppConfig,
    targets: &TargetRegistry,
    stream: bool,
    policy: &RestartPolicy,
    cancel: &CancellationToken,
) -> Result<(), RetryError<PipelineError>> {
    let executor = RetryExecutor::new();
    let options = policy.retry_options();
    executor
        .execute(&options, cancel, |attempt| {
            let pipeline = Arc::clone(pipeline);
            let settings = config.pipeline.clone();
            let targets = targets.clone();
            async move {
                info!(attempt, "Relaunching pipeline");
                pipeline.start_preview(settings).await?;
                if stream {
                    pipeline.start_stream(&targets).await?;
                }
                Ok::<_, PipelineError>(())
            }
        })
        .await
}

/// Bring the pipeline back after a failure, pausing while the breaker is open.
///
/// Returns false when the program should exit instead.
async fn recover(
    pipeline: &Arc<PipelineStateMachine>,
    config: &AppConfig,
    targets: &TargetRegistry,
    stream: bool,
    policy: &RestartPolicy,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if let FailureVerdict::CoolDown(wait) = policy.on_failure() {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted during cooldown");
                    return false;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        match relaunch(pipeline, config, targets, stream, policy, cancel).await {
            Ok(()) => {
                info!("Pipeline relaunched");
                return true;
            }
            Err(e) if is_fatal(&e) => {
                error!("Relaunch abandoned: {}", PipelineError::from(e).user_message());
                return false;
            }
            Err(e) => warn!("Relaunch failed: {}", e),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    let mut config = AppConfig::load(&args.config)?;
    config.probe.enabled |= args.probe;
    config.restart.enabled |= args.restart;
    info!(path = %args.config.display(), targets = config.targets.len(), "Configuration loaded");

    let (event_tx, event_rx) = event_channel();
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let pump = spawn_event_pump(event_rx, failure_tx, cancel.clone());

    let pipeline = Arc::new(create_pipeline(
        config.arguments.clone(),
        Arc::new(DiscardSinkFactory),
        event_tx,
    ));
    let targets = TargetRegistry::from_targets(config.targets.clone())
        .context("Invalid target list")?;
    let breakers = Arc::new(CircuitBreakerRegistry::default());

    pipeline
        .start_preview(config.pipeline.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.user_message(), e))?;

    if args.stream {
        if config.probe.enabled {
            probe_targets(&targets, &config, Arc::clone(&breakers), &cancel).await?;
        }
        pipeline
            .start_stream(&targets)
            .await
            .map_err(|e| anyhow::anyhow!("{}: {}", e.user_message(), e))?;
    }

    let policy = RestartPolicy::new(
        breakers.get_or_create_with("pipeline:relaunch", config.restart.breaker_config()),
        config.restart.clone(),
    );
    let mut stable_at = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = sleep_until(stable_at), if stable_at.is_some() => {
                policy.on_stable();
                stable_at = None;
            }
            failure = failure_rx.recv() => {
                let Some(message) = failure else { break };
                if !config.restart.enabled {
                    warn!("Pipeline failed: {}", message);
                    break;
                }
                stable_at = None;
                if !recover(&pipeline, &config, &targets, args.stream, &policy, &cancel).await {
                    break;
                }
                stable_at = Some(Instant::now() + policy.stable_period());
                while failure_rx.try_recv().is_ok() {}
            }
        }
    }

    pipeline.stop_all().await;
    cancel.cancel();
    if let Err(e) = pump.await {
        warn!("Event pump ended abnormally: {}", e);
    }
    info!("Goodbye");
    Ok(())
}
