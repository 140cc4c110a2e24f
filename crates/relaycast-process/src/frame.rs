//! Raw preview frame decoding.
//!
//! The encoder writes headerless frames of exactly `width * height * 3` bytes
//! (packed BGR, row-major) to its primary output. End of stream is the only
//! boundary signal.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use relaycast_ipc::BYTES_PER_PIXEL;

use crate::error::ProcessError;
use crate::ProcessResult;

/// Receives decoded frames.
///
/// The slice is only valid for the duration of the call; the channel reuses
/// its buffer for the next frame, so implementations copy what they keep.
pub trait FrameSink: Send {
    fn deliver(&mut self, frame: &[u8]);
}

impl<F> FrameSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn deliver(&mut self, frame: &[u8]) {
        self(frame)
    }
}

/// Counters shared between a frame channel and whoever reports on it.
#[derive(Debug)]
pub struct FrameCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
    cadence: u64,
    notify: Notify,
}

impl FrameCounters {
    /// Create counters that signal [`FrameCounters::notified`] every `cadence` frames.
    pub fn new(cadence: u64) -> Self {
        Self {
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            cadence: cadence.max(1),
            notify: Notify::new(),
        }
    }

    /// Count one decoded frame of `len` bytes.
    pub fn record_frame(&self, len: usize) -> u64 {
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        let frames = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if frames % self.cadence == 0 {
            self.notify.notify_one();
        }
        frames
    }

    /// Complete frames read so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Bytes of complete frames read so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Resolves after the next cadence boundary.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

impl Default for FrameCounters {
    fn default() -> Self {
        Self::new(30)
    }
}

/// How a frame channel run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameChannelEnd {
    /// The stream reached end of file.
    StreamClosed,

    /// The cancellation token fired.
    Cancelled,
}

/// Result of a frame channel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChannelSummary {
    pub frames: u64,
    pub discarded_bytes: usize,
    pub end: FrameChannelEnd,
}

/// Decoder for the fixed-size raw frame protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChannel {
    width: u32,
    height: u32,
    frame_size: usize,
}

impl FrameChannel {
    /// Create a channel for `width x height` frames.
    pub fn new(width: u32, height: u32) -> ProcessResult<Self> {
        let frame_size = (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
            .filter(|size| *size > 0)
            .ok_or(ProcessError::InvalidFrameSize { width, height })?;

        Ok(Self {
            width,
            height,
            frame_size,
        })
    }

    /// Frame width and height in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Decode frames from `reader` until end of stream or cancellation.
    ///
    /// A zero-byte read is a normal end of stream, even mid-frame; the partial
    /// frame is discarded. Frames reach `sink` in stream order.
    #[instrument(name = "frame_channel", skip_all, fields(width = self.width, height = self.height))]
    pub async fn run<R, S>(
        &self,
        mut reader: R,
        sink: &mut S,
        counters: &FrameCounters,
        cancel: &CancellationToken,
    ) -> ProcessResult<FrameChannelSummary>
    where
        R: AsyncRead + Unpin,
        S: FrameSink + ?Sized,
    {
        let mut buffer = BytesMut::zeroed(self.frame_size);
        let mut filled = 0usize;
        let mut frames = 0u64;

        debug!(frame_size = self.frame_size, "Frame channel started");

        let end = loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break FrameChannelEnd::Cancelled,
                read = reader.read(&mut buffer[filled..]) => read?,
            };

            if read == 0 {
                break FrameChannelEnd::StreamClosed;
            }

            filled += read;
            if filled < self.frame_size {
                continue;
            }

            frames = counters.record_frame(self.frame_size);
            sink.deliver(&buffer[..]);
            filled = 0;

            if frames <= 3 || frames % 300 == 0 {
                trace!(frames, "Frame delivered");
            }
        };

        debug!(frames, discarded = filled, ?end, "Frame channel stopped");

        Ok(FrameChannelSummary {
            frames: counters.frames(),
            discarded_bytes: filled,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame_pattern(frames: usize, frame_size: usize) -> Vec<u8> {
        (0..frames * frame_size).map(|i| (i / frame_size) as u8).collect()
    }

    #[tokio::test]
    async fn test_delivers_whole_frames_in_order() {
        let channel = FrameChannel::new(4, 2).unwrap();
        assert_eq!(channel.frame_size(), 24);

        let mut data = frame_pattern(3, 24);
        data.extend_from_slice(&[9u8; 10]);

        let mut received: Vec<Vec<u8>> = Vec::new();
        let mut sink = |frame: &[u8]| received.push(frame.to_vec());
        let counters = FrameCounters::new(30);
        let cancel = CancellationToken::new();

        let summary = channel
            .run(&data[..], &mut sink, &counters, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.discarded_bytes, 10);
        assert_eq!(summary.end, FrameChannelEnd::StreamClosed);
        assert_eq!(counters.bytes(), 72);

        assert_eq!(received.len(), 3);
        for (index, frame) in received.iter().enumerate() {
            assert_eq!(frame.len(), 24);
            assert!(frame.iter().all(|b| *b == index as u8));
        }
    }

    #[tokio::test]
    async fn test_reassembles_fragmented_reads() {
        let channel = FrameChannel::new(2, 2).unwrap();
        let data = frame_pattern(2, 12);

        let (mut writer, reader) = tokio::io::duplex(5);
        let feed = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in data.chunks(5) {
                writer.write_all(chunk).await.unwrap();
            }
        });

        let mut sizes = Vec::new();
        let mut sink = |frame: &[u8]| sizes.push(frame.len());
        let counters = FrameCounters::default();
        let cancel = CancellationToken::new();

        let summary = channel
            .run(reader, &mut sink, &counters, &cancel)
            .await
            .unwrap();
        feed.await.unwrap();

        assert_eq!(summary.frames, 2);
        assert_eq!(sizes, vec![12, 12]);
    }

    #[tokio::test]
    async fn test_empty_stream_is_not_an_error() {
        let channel = FrameChannel::new(2, 2).unwrap();
        let mut sink = |_: &[u8]| panic!("no frame expected");
        let counters = FrameCounters::default();
        let cancel = CancellationToken::new();

        let summary = channel
            .run(tokio::io::empty(), &mut sink, &counters, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.end, FrameChannelEnd::StreamClosed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_pending_read() {
        let channel = FrameChannel::new(2, 2).unwrap();
        let (_writer, reader) = tokio::io::duplex(64);
        let mut sink = |_: &[u8]| {};
        let counters = FrameCounters::default();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let summary = channel
            .run(reader, &mut sink, &counters, &cancel)
            .await
            .unwrap();
        assert_eq!(summary.end, FrameChannelEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_cadence_notifies() {
        let counters = FrameCounters::new(2);
        counters.record_frame(1);
        counters.record_frame(1);
        tokio::time::timeout(Duration::from_secs(1), counters.notified())
            .await
            .expect("notified at cadence");
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(matches!(
            FrameChannel::new(0, 10),
            Err(ProcessError::InvalidFrameSize { .. })
        ));
    }
}
