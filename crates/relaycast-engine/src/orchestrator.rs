//! Pipeline orchestrator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use relaycast_ipc::{
    PipelineConfig, PipelineEvent, PipelineState, PipelineStatistics, StopReason,
};
use relaycast_process::{
    resolve_encoder, CriticalIssue, CriticalKind, ProcessExit, DEFAULT_GRACE_PERIOD,
    DEFAULT_JOIN_TIMEOUT, DEFAULT_STATISTICS_CADENCE,
};
use relaycast_transport::{ResolvedTarget, TargetRegistry};

use crate::arguments::ArgumentBuilder;
use crate::error::PipelineError;
use crate::metrics::StatisticsAggregator;
use crate::session::{LaunchPlan, Session, SessionMode};
use crate::sink::PreviewSinkFactory;
use crate::PipelineResult;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Wait for a graceful encoder exit before killing it.
    pub grace_period: Duration,

    /// Bounded wait for each background task on stop.
    pub join_timeout: Duration,

    /// Frames between statistics snapshots.
    pub statistics_cadence: u64,

    /// Snapshot period for sessions without preview frames.
    pub statistics_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            statistics_cadence: DEFAULT_STATISTICS_CADENCE,
            statistics_interval: Duration::from_secs(1),
        }
    }
}

/// State visible to background tasks.
pub(crate) struct Shared {
    state: AtomicU8,
    event_tx: Sender<PipelineEvent>,
    config: RwLock<Option<PipelineConfig>>,
    statistics: RwLock<Option<Arc<StatisticsAggregator>>>,
}

impl Shared {
    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition_to(&self, next: PipelineState) {
        let previous = PipelineState::from_u8(self.state.swap(next as u8, Ordering::SeqCst));
        if previous == next {
            return;
        }

        debug!(previous = %previous, current = %next, "State transition");

        self.send_event(PipelineEvent::StateChanged {
            previous,
            current: next,
        });
    }

    /// Publish without blocking; a full channel drops the event.
    pub(crate) fn send_event(&self, event: PipelineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Guarded by the transition lock.
struct Control {
    session: Option<Session>,
    generation: u64,
    targets: Vec<ResolvedTarget>,
}

/// Drives the encoder through `Stopped`, `Starting`, `PreviewOnly`,
/// `Streaming`, `Stopping` and `Error`.
///
/// Every `start_*`/`stop_*` call holds one async lock for its whole duration,
/// so transitions never interleave. [`PipelineStateMachine::state`] reads an
/// atomic and never waits. Switching between preview and stream relaunches
/// the encoder. Mid-session failures move the machine to `Error` and are
/// reported on the event channel; nothing is restarted automatically.
pub struct PipelineStateMachine {
    shared: Arc<Shared>,
    control: Arc<Mutex<Control>>,
    builder: Arc<dyn ArgumentBuilder>,
    sink_factory: Arc<dyn PreviewSinkFactory>,
    options: EngineOptions,
}

impl PipelineStateMachine {
    /// Create a stopped machine publishing on `event_tx`.
    pub fn new(
        builder: Arc<dyn ArgumentBuilder>,
        sink_factory: Arc<dyn PreviewSinkFactory>,
        event_tx: Sender<PipelineEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PipelineState::Stopped as u8),
                event_tx,
                config: RwLock::new(None),
                statistics: RwLock::new(None),
            }),
            control: Arc::new(Mutex::new(Control {
                session: None,
                generation: 0,
                targets: Vec::new(),
            })),
            builder,
            sink_factory,
            options: EngineOptions::default(),
        }
    }

    /// Replace the default [`EngineOptions`].
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Current state. Never waits on a transition.
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Live statistics of the current session, zeroed when none is running.
    pub fn statistics(&self) -> PipelineStatistics {
        let state = self.state();
        match self.shared.statistics.read().as_ref() {
            Some(aggregator) => aggregator.snapshot(state),
            None => PipelineStatistics {
                state,
                ..Default::default()
            },
        }
    }

    /// Configuration of the last accepted `start_preview`.
    pub fn config(&self) -> Option<PipelineConfig> {
        self.shared.config.read().clone()
    }

    /// Destinations of the running stream.
    pub async fn streaming_targets(&self) -> Vec<ResolvedTarget> {
        self.control.lock().await.targets.clone()
    }

    /// Launch the encoder with preview-only arguments.
    ///
    /// The configuration is validated and the encoder located before anything
    /// changes, so a rejected call leaves the machine `Stopped`. Ignored while
    /// a session is running.
    #[instrument(name = "start_preview", skip_all)]
    pub async fn start_preview(&self, config: PipelineConfig) -> PipelineResult<()> {
        let mut control = self.control.lock().await;

        let state = self.state();
        if !state.can_start() {
            info!(%state, "Pipeline already running, ignoring start preview");
            return Ok(());
        }

        config.validate().map_err(|e| rejected(e.into()))?;
        let encoder = locate_encoder(&config)?;
        let arguments = self.builder.preview_arguments(&config);

        *self.shared.config.write() = Some(config.clone());

        info!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            "Starting preview"
        );
        self.relaunch(&mut control, &config, encoder, &arguments, SessionMode::Preview, Vec::new())
            .await
    }

    /// Relaunch the encoder feeding every active target in `targets`.
    ///
    /// Fails without touching the running preview when no target is active
    /// or one is malformed. Ignored while already streaming.
    #[instrument(name = "start_stream", skip_all)]
    pub async fn start_stream(&self, targets: &TargetRegistry) -> PipelineResult<()> {
        let mut control = self.control.lock().await;

        let state = self.state();
        if matches!(
            state,
            PipelineState::Streaming | PipelineState::Starting | PipelineState::Stopping
        ) {
            info!(%state, "Pipeline already streaming, ignoring start stream");
            return Ok(());
        }

        let config = self.config().ok_or_else(|| rejected(PipelineError::NotConfigured))?;
        let resolved = targets.resolved().map_err(|e| rejected(e.into()))?;
        if resolved.is_empty() {
            return Err(rejected(PipelineError::NoActiveTargets));
        }
        let encoder = locate_encoder(&config)?;
        let arguments = self.builder.stream_arguments(&config, &resolved);

        info!(
            targets = resolved.len(),
            names = ?resolved.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Starting stream"
        );
        self.relaunch(&mut control, &config, encoder, &arguments, SessionMode::Stream, resolved)
            .await
    }

    /// Relaunch the encoder with preview-only arguments. Ignored unless streaming.
    #[instrument(name = "stop_stream", skip_all)]
    pub async fn stop_stream(&self) -> PipelineResult<()> {
        let mut control = self.control.lock().await;

        let state = self.state();
        if state != PipelineState::Streaming {
            info!(%state, "Not streaming, ignoring stop stream");
            return Ok(());
        }

        let config = self.config().ok_or_else(|| rejected(PipelineError::NotConfigured))?;
        let encoder = locate_encoder(&config)?;
        let arguments = self.builder.preview_arguments(&config);

        info!("Stopping stream, returning to preview");
        self.relaunch(&mut control, &config, encoder, &arguments, SessionMode::Preview, Vec::new())
            .await
    }

    /// Stop the encoder and return to `Stopped`. Safe to call in any state.
    #[instrument(name = "stop_all", skip_all)]
    pub async fn stop_all(&self) {
        let mut control = self.control.lock().await;

        let state = self.state();
        if state == PipelineState::Stopped && control.session.is_none() {
            debug!("Already stopped");
            return;
        }

        info!(%state, "Stopping pipeline");
        self.shared.transition_to(PipelineState::Stopping);
        self.end_session(&mut control, StopReason::UserRequested).await;
        self.shared.transition_to(PipelineState::Stopped);
        info!("Pipeline stopped");
    }

    /// Tear down the current session, if any, and launch a new one.
    async fn relaunch(
        &self,
        control: &mut Control,
        config: &PipelineConfig,
        encoder: PathBuf,
        arguments: &str,
        mode: SessionMode,
        targets: Vec<ResolvedTarget>,
    ) -> PipelineResult<()> {
        if control.session.is_some() {
            self.shared.transition_to(PipelineState::Stopping);
            self.end_session(control, StopReason::Reconfigure).await;
        }

        self.shared.transition_to(PipelineState::Starting);
        control.generation += 1;
        let generation = control.generation;

        let plan = LaunchPlan {
            generation,
            mode,
            encoder: &encoder,
            arguments,
            config,
        };

        match Session::launch(plan, &self.options, self.sink_factory.as_ref(), &self.shared) {
            Ok((mut session, critical_rx)) => {
                *self.shared.statistics.write() = Some(session.statistics().clone());

                let monitor = tokio::spawn(monitor_session(
                    generation,
                    session.exit_watch(),
                    critical_rx,
                    session.stop_flag(),
                    self.control.clone(),
                    self.shared.clone(),
                ));
                session.set_monitor(monitor);

                control.session = Some(session);
                control.targets = targets;
                self.shared.transition_to(mode.running_state());
                Ok(())
            }
            Err(e) => {
                error!(generation, "Encoder launch failed: {}", e);
                self.shared.transition_to(PipelineState::Error);
                self.shared.send_event(PipelineEvent::Error {
                    message: e.user_message().to_string(),
                });
                Err(e)
            }
        }
    }

    async fn end_session(&self, control: &mut Control, reason: StopReason) {
        control.targets.clear();
        let Some(mut session) = control.session.take() else {
            return;
        };

        debug!(
            generation = session.generation(),
            mode = ?session.mode(),
            reason = %reason.message(),
            "Ending session"
        );
        let exit = session.shutdown().await;
        *self.shared.statistics.write() = None;

        self.shared.send_event(PipelineEvent::ProcessExited {
            code: exit.and_then(|e| e.code),
            requested: true,
            reason,
        });
    }
}

impl Drop for PipelineStateMachine {
    fn drop(&mut self) {
        // Dropping the session kills the encoder.
        if let Ok(mut control) = self.control.try_lock() {
            if control.session.take().is_some() {
                debug!("Pipeline dropped with a live session");
            }
        }
    }
}

/// How a session ended without being asked to.
#[derive(Debug)]
enum SessionEnd {
    Exited(Option<ProcessExit>),
    Critical(CriticalIssue),
}

/// Watch one generation for an unrequested exit or a critical log line.
async fn monitor_session(
    generation: u64,
    mut exit_rx: watch::Receiver<Option<ProcessExit>>,
    mut critical_rx: mpsc::UnboundedReceiver<CriticalIssue>,
    stop_requested: Arc<AtomicBool>,
    control: Arc<Mutex<Control>>,
    shared: Arc<Shared>,
) {
    let end = tokio::select! {
        exit = async { exit_rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit) } => {
            SessionEnd::Exited(exit)
        }
        Some(issue) = critical_rx.recv() => SessionEnd::Critical(issue),
    };

    if stop_requested.load(Ordering::SeqCst) {
        return;
    }

    let mut control = control.lock().await;
    if control.generation != generation || stop_requested.load(Ordering::SeqCst) {
        return;
    }
    let Some(mut session) = control.session.take() else {
        return;
    };
    session.detach_monitor();
    control.targets.clear();

    let failure = match &end {
        SessionEnd::Exited(Some(exit)) if exit.success => None,
        SessionEnd::Exited(exit) => {
            let code = exit.and_then(|e| e.code);
            Some(PipelineError::ProcessCrashed {
                code,
                detail: match code {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated".to_string(),
                },
            })
        }
        SessionEnd::Critical(issue) => Some(match issue.kind {
            CriticalKind::ConnectionLost => PipelineError::ConnectionLost(issue.line.clone()),
            CriticalKind::EncoderFailure => PipelineError::ProcessCrashed {
                code: None,
                detail: issue.line.clone(),
            },
        }),
    };

    match &failure {
        Some(e) => {
            error!(generation, "Pipeline failed: {}", e);
            shared.transition_to(PipelineState::Error);
            shared.send_event(PipelineEvent::Error {
                message: e.user_message().to_string(),
            });
        }
        None => {
            info!(generation, "Encoder exited on its own");
            shared.transition_to(PipelineState::Stopping);
        }
    }

    let exit = session.shutdown().await;
    *shared.statistics.write() = None;

    let code = exit.and_then(|e| e.code);
    let reason = match end {
        SessionEnd::Exited(_) => StopReason::ProcessExited { code },
        SessionEnd::Critical(issue) => match issue.kind {
            CriticalKind::ConnectionLost => StopReason::ConnectionLost {
                message: issue.line,
            },
            CriticalKind::EncoderFailure => StopReason::CriticalIssue {
                message: issue.line,
            },
        },
    };
    shared.send_event(PipelineEvent::ProcessExited {
        code,
        requested: matches!(reason, StopReason::ConnectionLost { .. } | StopReason::CriticalIssue { .. }),
        reason,
    });

    if failure.is_none() {
        shared.transition_to(PipelineState::Stopped);
    }
}

/// Locate the encoder, logging the miss.
fn locate_encoder(config: &PipelineConfig) -> PipelineResult<PathBuf> {
    resolve_encoder(config.encoder_path.as_deref()).map_err(|e| rejected(e.into()))
}

fn rejected(err: PipelineError) -> PipelineError {
    warn!("Request rejected: {}", err);
    err
}
