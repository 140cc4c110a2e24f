//! Pipeline throughput statistics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use relaycast_ipc::{EncoderProgress, PipelineState, PipelineStatistics};
use relaycast_process::FrameCounters;

/// Rates derived from raw counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub fps: f64,
    pub bitrate_kbps: f64,
}

/// Turns one session's counters into [`PipelineStatistics`].
///
/// Rates are cumulative since the session started. The encoder's own
/// instantaneous figures ride along in [`PipelineStatistics::encoder`].
#[derive(Debug)]
pub struct StatisticsAggregator {
    counters: Arc<FrameCounters>,
    started: Instant,
    progress: RwLock<Option<EncoderProgress>>,
}

impl StatisticsAggregator {
    /// Start aggregating now.
    pub fn new(counters: Arc<FrameCounters>) -> Self {
        Self {
            counters,
            started: Instant::now(),
            progress: RwLock::new(None),
        }
    }

    /// `fps = frames / secs`, `kbps = bytes * 8 / 1000 / secs`. Zero before any time has passed.
    pub fn compute(frames: u64, elapsed: Duration, bytes: u64) -> Rates {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Rates::default();
        }

        Rates {
            fps: frames as f64 / secs,
            bitrate_kbps: bytes as f64 * 8.0 / 1000.0 / secs,
        }
    }

    /// Counters fed by the frame reader.
    pub fn counters(&self) -> &Arc<FrameCounters> {
        &self.counters
    }

    /// Remember the latest encoder progress line.
    pub fn record_progress(&self, progress: EncoderProgress) {
        *self.progress.write() = Some(progress);
    }

    /// Time since this aggregator was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current snapshot tagged with `state`.
    pub fn snapshot(&self, state: PipelineState) -> PipelineStatistics {
        let frames = self.counters.frames();
        let bytes = self.counters.bytes();
        let uptime = self.uptime();
        let rates = Self::compute(frames, uptime, bytes);

        PipelineStatistics {
            frames_received: frames,
            fps: rates.fps,
            bytes_received: bytes,
            bitrate_kbps: rates.bitrate_kbps,
            uptime,
            state,
            encoder: self.progress.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_rates() {
        let rates = StatisticsAggregator::compute(300, Duration::from_secs(10), 5_000_000);
        assert_eq!(rates.fps, 30.0);
        assert_eq!(rates.bitrate_kbps, 4000.0);
    }

    #[test]
    fn test_compute_zero_elapsed() {
        assert_eq!(
            StatisticsAggregator::compute(10, Duration::ZERO, 100),
            Rates::default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_cumulative() {
        let counters = Arc::new(FrameCounters::new(30));
        let aggregator = StatisticsAggregator::new(counters.clone());

        for _ in 0..60 {
            counters.record_frame(1000);
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        let snapshot = aggregator.snapshot(PipelineState::PreviewOnly);
        assert_eq!(snapshot.frames_received, 60);
        assert_eq!(snapshot.bytes_received, 60_000);
        assert!((snapshot.fps - 30.0).abs() < 1e-6);
        assert!((snapshot.bitrate_kbps - 240.0).abs() < 1e-6);
        assert_eq!(snapshot.state, PipelineState::PreviewOnly);
        assert!(snapshot.encoder.is_none());

        aggregator.record_progress(EncoderProgress {
            frame: 58,
            fps: 29.5,
            ..Default::default()
        });
        let snapshot = aggregator.snapshot(PipelineState::Streaming);
        assert_eq!(snapshot.encoder.map(|p| p.frame), Some(58));
    }
}
