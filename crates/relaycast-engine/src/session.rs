//! One encoder generation and its background tasks.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaycast_ipc::{EncoderProgress, LogLevel, PipelineConfig, PipelineEvent, PipelineState};
use relaycast_process::{
    CriticalIssue, FrameChannel, FrameCounters, LogChannel, LogHandler, ProcessExit,
    ProcessSupervisor, SupervisorOptions,
};

use crate::metrics::StatisticsAggregator;
use crate::orchestrator::{EngineOptions, Shared};
use crate::sink::PreviewSinkFactory;
use crate::PipelineResult;

/// What a generation feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionMode {
    Preview,
    Stream,
}

impl SessionMode {
    pub(crate) fn running_state(self) -> PipelineState {
        match self {
            Self::Preview => PipelineState::PreviewOnly,
            Self::Stream => PipelineState::Streaming,
        }
    }
}

pub(crate) struct LaunchPlan<'a> {
    pub generation: u64,
    pub mode: SessionMode,
    pub encoder: &'a Path,
    pub arguments: &'a str,
    pub config: &'a PipelineConfig,
}

/// A running encoder with its frame, log, statistics and monitor tasks.
///
/// Frame and log readers are attached to the supervisor, which joins them on
/// stop. The statistics reporter and the monitor are owned here.
pub(crate) struct Session {
    generation: u64,
    mode: SessionMode,
    supervisor: ProcessSupervisor,
    statistics: Arc<StatisticsAggregator>,
    stop_requested: Arc<AtomicBool>,
    cancel: CancellationToken,
    join_timeout: Duration,
    reporter: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Session {
    /// Launch the encoder and start the readers.
    pub(crate) fn launch(
        plan: LaunchPlan<'_>,
        options: &EngineOptions,
        sink_factory: &dyn PreviewSinkFactory,
        shared: &Arc<Shared>,
    ) -> PipelineResult<(Self, mpsc::UnboundedReceiver<CriticalIssue>)> {
        let config = plan.config;
        let channel = if config.preview_enabled {
            Some(FrameChannel::new(config.width, config.height)?)
        } else {
            None
        };

        let mut supervisor = ProcessSupervisor::start(
            plan.encoder,
            plan.arguments,
            SupervisorOptions {
                grace_period: options.grace_period,
                join_timeout: options.join_timeout,
                capture_stdout: channel.is_some(),
            },
        )?;

        let counters = Arc::new(FrameCounters::new(options.statistics_cadence));
        let statistics = Arc::new(StatisticsAggregator::new(counters.clone()));
        let cancel = CancellationToken::new();
        let (critical_tx, critical_rx) = mpsc::unbounded_channel();

        if let (Some(channel), Some(stdout)) = (channel, supervisor.take_stdout()) {
            let mut sink = sink_factory.create(config.width, config.height);
            let counters = counters.clone();
            let cancel = cancel.clone();
            let generation = plan.generation;

            let handle = tokio::spawn(async move {
                match channel.run(stdout, sink.as_mut(), &counters, &cancel).await {
                    Ok(summary) => debug!(
                        generation,
                        frames = summary.frames,
                        discarded = summary.discarded_bytes,
                        end = ?summary.end,
                        "Frame reader finished"
                    ),
                    Err(e) => warn!(generation, "Frame reader failed: {}", e),
                }
            });
            supervisor.attach_reader("frame", handle);
        }

        if let Some(stderr) = supervisor.take_stderr() {
            let mut handler = SessionLogHandler {
                shared: shared.clone(),
                statistics: statistics.clone(),
                critical_tx,
            };
            let cancel = cancel.clone();
            let generation = plan.generation;

            let handle = tokio::spawn(async move {
                match LogChannel::new().run(stderr, &mut handler, &cancel).await {
                    Ok(summary) => debug!(
                        generation,
                        lines = summary.lines,
                        progress = summary.progress_lines,
                        "Log reader finished"
                    ),
                    Err(e) => warn!(generation, "Log reader failed: {}", e),
                }
            });
            supervisor.attach_reader("log", handle);
        }

        let interval = (!config.preview_enabled).then_some(options.statistics_interval);
        let reporter = tokio::spawn(report_statistics(
            statistics.clone(),
            shared.clone(),
            interval,
            cancel.clone(),
        ));

        info!(
            generation = plan.generation,
            mode = ?plan.mode,
            pid = supervisor.pid(),
            "Session launched"
        );

        Ok((
            Self {
                generation: plan.generation,
                mode: plan.mode,
                supervisor,
                statistics,
                stop_requested: Arc::new(AtomicBool::new(false)),
                cancel,
                join_timeout: options.join_timeout,
                reporter: Some(reporter),
                monitor: None,
            },
            critical_rx,
        ))
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn mode(&self) -> SessionMode {
        self.mode
    }

    pub(crate) fn statistics(&self) -> &Arc<StatisticsAggregator> {
        &self.statistics
    }

    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.supervisor.exit_watch()
    }

    /// Set once a stop has been asked for; the monitor ignores exits after that.
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub(crate) fn set_monitor(&mut self, monitor: JoinHandle<()>) {
        self.monitor = Some(monitor);
    }

    /// Called by the monitor on its own session so shutdown does not abort it.
    pub(crate) fn detach_monitor(&mut self) {
        self.monitor = None;
    }

    /// Stop the encoder and every task of this generation.
    pub(crate) async fn shutdown(&mut self) -> Option<ProcessExit> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        let exit = self.supervisor.stop().await;
        self.cancel.cancel();

        if let Some(mut reporter) = self.reporter.take() {
            if tokio::time::timeout(self.join_timeout, &mut reporter)
                .await
                .is_err()
            {
                warn!(generation = self.generation, "Statistics reporter did not finish in time");
                reporter.abort();
            }
        }

        debug!(generation = self.generation, ?exit, "Session shut down");
        exit
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
    }
}

/// Publishes diagnostic lines and forwards critical ones to the monitor.
struct SessionLogHandler {
    shared: Arc<Shared>,
    statistics: Arc<StatisticsAggregator>,
    critical_tx: mpsc::UnboundedSender<CriticalIssue>,
}

impl LogHandler for SessionLogHandler {
    fn on_line(&mut self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Error => error!(target: "relaycast::encoder", "{}", line),
            LogLevel::Warning => warn!(target: "relaycast::encoder", "{}", line),
            LogLevel::Info => debug!(target: "relaycast::encoder", "{}", line),
        }

        self.shared.send_event(PipelineEvent::Log {
            level,
            line: line.to_string(),
        });
    }

    fn on_progress(&mut self, progress: EncoderProgress) {
        self.statistics.record_progress(progress);
    }

    fn on_critical(&mut self, issue: CriticalIssue) {
        warn!(pattern = issue.pattern, kind = ?issue.kind, "Critical encoder output");
        self.shared.send_event(PipelineEvent::CriticalIssue {
            message: issue.line.clone(),
        });
        // The monitor may already be gone after a stop.
        let _ = self.critical_tx.send(issue);
    }
}

async fn report_statistics(
    statistics: Arc<StatisticsAggregator>,
    shared: Arc<Shared>,
    interval: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = statistics.counters().notified() => {}
            _ = next_tick(&mut ticker) => {}
        }

        let snapshot = statistics.snapshot(shared.state());
        shared.send_event(PipelineEvent::Statistics(snapshot));
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
