//! Encoder diagnostic stream.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use relaycast_ipc::{EncoderProgress, LogLevel};

use crate::progress::parse_progress;
use crate::ProcessResult;

/// Lines longer than this are split.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// What a critical diagnostic pattern means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalKind {
    /// The encoder cannot read its input or apply its settings.
    EncoderFailure,

    /// A broadcast destination is unreachable.
    ConnectionLost,
}

/// A diagnostic line matching a critical pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalIssue {
    pub kind: CriticalKind,
    pub pattern: &'static str,
    pub line: String,
}

/// Lower-case substrings after which the encoder cannot proceed.
pub const CRITICAL_PATTERNS: &[(&str, CriticalKind)] = &[
    ("could not set video options", CriticalKind::EncoderFailure),
    ("error opening input", CriticalKind::EncoderFailure),
    ("unknown encoder", CriticalKind::EncoderFailure),
    ("conversion failed", CriticalKind::EncoderFailure),
    ("device or resource busy", CriticalKind::EncoderFailure),
    ("connection refused", CriticalKind::ConnectionLost),
    ("connection reset by peer", CriticalKind::ConnectionLost),
    ("broken pipe", CriticalKind::ConnectionLost),
    ("failed to connect", CriticalKind::ConnectionLost),
    ("server returned 404", CriticalKind::ConnectionLost),
];

/// Classify a line by case-insensitive `error`/`warning` substrings.
pub fn classify_line(line: &str) -> LogLevel {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") {
        LogLevel::Error
    } else if lower.contains("warning") {
        LogLevel::Warning
    } else {
        LogLevel::Info
    }
}

/// Match a line against [`CRITICAL_PATTERNS`].
pub fn detect_critical(line: &str) -> Option<CriticalIssue> {
    let lower = line.to_ascii_lowercase();
    CRITICAL_PATTERNS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|&(pattern, kind)| CriticalIssue {
            kind,
            pattern,
            line: line.to_string(),
        })
}

/// Receives classified diagnostic output.
pub trait LogHandler: Send {
    /// Every non-progress line, in stream order.
    fn on_line(&mut self, level: LogLevel, line: &str);

    /// Progress lines.
    fn on_progress(&mut self, _progress: EncoderProgress) {}

    /// Lines matching a critical pattern, raised after `on_line`.
    fn on_critical(&mut self, issue: CriticalIssue);
}

/// Result of a log channel run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogChannelSummary {
    pub lines: u64,
    pub progress_lines: u64,
    pub critical: u64,
}

/// Line reader for the encoder's diagnostic stream.
///
/// Lines end at `\n` or `\r`; the encoder rewrites its progress line in place
/// with carriage returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

impl LogChannel {
    /// Create a reader.
    pub fn new() -> Self {
        Self
    }

    /// Read `reader` to end of stream or cancellation.
    #[instrument(name = "log_channel", skip_all)]
    pub async fn run<R, H>(
        &self,
        mut reader: R,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> ProcessResult<LogChannelSummary>
    where
        R: AsyncRead + Unpin,
        H: LogHandler + ?Sized,
    {
        let mut summary = LogChannelSummary::default();
        let mut pending = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = reader.read(&mut chunk) => read?,
            };

            if read == 0 {
                break;
            }

            pending.extend_from_slice(&chunk[..read]);

            while let Some(end) = pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
                let line = pending.split_to(end);
                pending.advance(1);
                dispatch(&line, handler, &mut summary);
            }

            if pending.len() > MAX_LINE_LENGTH {
                let line = pending.split();
                dispatch(&line, handler, &mut summary);
            }
        }

        if !pending.is_empty() {
            dispatch(&pending, handler, &mut summary);
        }

        debug!(
            lines = summary.lines,
            critical = summary.critical,
            "Log channel stopped"
        );
        Ok(summary)
    }
}

fn dispatch<H>(raw: &[u8], handler: &mut H, summary: &mut LogChannelSummary)
where
    H: LogHandler + ?Sized,
{
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return;
    }

    if let Some(progress) = parse_progress(line) {
        summary.progress_lines += 1;
        handler.on_progress(progress);
        return;
    }

    summary.lines += 1;
    handler.on_line(classify_line(line), line);

    if let Some(issue) = detect_critical(line) {
        summary.critical += 1;
        handler.on_critical(issue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        lines: Vec<(LogLevel, String)>,
        progress: Vec<EncoderProgress>,
        critical: Vec<CriticalIssue>,
    }

    impl LogHandler for Recorder {
        fn on_line(&mut self, level: LogLevel, line: &str) {
            self.lines.push((level, line.to_string()));
        }

        fn on_progress(&mut self, progress: EncoderProgress) {
            self.progress.push(progress);
        }

        fn on_critical(&mut self, issue: CriticalIssue) {
            self.critical.push(issue);
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify_line("[rtmp] ERROR: handshake"), LogLevel::Error);
        assert_eq!(classify_line("Warning: deprecated pixel format"), LogLevel::Warning);
        assert_eq!(classify_line("Stream mapping:"), LogLevel::Info);
    }

    #[test]
    fn test_critical_patterns() {
        let issue = detect_critical("[dshow] Could not set video options").unwrap();
        assert_eq!(issue.kind, CriticalKind::EncoderFailure);

        let issue = detect_critical("rtmp://a/b: Connection refused").unwrap();
        assert_eq!(issue.kind, CriticalKind::ConnectionLost);
        assert_eq!(issue.pattern, "connection refused");

        assert!(detect_critical("Press [q] to stop").is_none());
    }

    #[tokio::test]
    async fn test_lines_in_order_with_carriage_returns() {
        let input = b"Input #0, dshow\nWarning: slow\r\nframe=  10 fps=30 bitrate=100.0kbits/s\rframe=  20 fps=30 bitrate=100.0kbits/s\rError opening input files\nlast line";
        let mut recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let summary = LogChannel::new()
            .run(&input[..], &mut recorder, &cancel)
            .await
            .unwrap();

        assert_eq!(summary.lines, 4);
        assert_eq!(summary.progress_lines, 2);
        assert_eq!(summary.critical, 1);

        let levels: Vec<_> = recorder.lines.iter().map(|(l, _)| *l).collect();
        assert_eq!(
            levels,
            vec![LogLevel::Info, LogLevel::Warning, LogLevel::Error, LogLevel::Info]
        );
        assert_eq!(recorder.lines[3].1, "last line");
        assert_eq!(recorder.progress[1].frame, 20);
        assert_eq!(recorder.critical[0].kind, CriticalKind::EncoderFailure);
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let input = vec![b'a'; MAX_LINE_LENGTH + READ_CHUNK + 10];
        let mut recorder = Recorder::default();
        let cancel = CancellationToken::new();

        LogChannel::new()
            .run(&input[..], &mut recorder, &cancel)
            .await
            .unwrap();

        let total: usize = recorder.lines.iter().map(|(_, l)| l.len()).sum();
        assert_eq!(total, input.len());
        assert!(recorder.lines.len() >= 2);
    }
}
