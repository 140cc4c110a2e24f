//! Encoder subprocess lifecycle.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::args::split_arguments;
use crate::error::ProcessError;
use crate::{ProcessResult, DEFAULT_GRACE_PERIOD, DEFAULT_JOIN_TIMEOUT};

/// Byte the encoder accepts on its control input as a quit request.
pub const QUIT_SIGNAL: &[u8] = b"q";

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long a graceful stop waits before killing the process tree.
    pub grace_period: Duration,

    /// Bounded wait for each attached reader during stop.
    pub join_timeout: Duration,

    /// Pipe the primary output; otherwise it is discarded.
    pub capture_stdout: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            capture_stdout: true,
        }
    }
}

/// How the encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal or when waiting failed.
    pub code: Option<i32>,
    pub success: bool,
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Owns one encoder process and its three standard streams.
///
/// Exit is observed by a watcher task that owns the child handle, so the
/// exit status is available without holding any lock. Readers attached with
/// [`ProcessSupervisor::attach_reader`] are joined on stop before the handles
/// are released.
#[derive(Debug)]
pub struct ProcessSupervisor {
    path: PathBuf,
    pid: Option<u32>,
    options: SupervisorOptions,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    readers: Vec<(&'static str, JoinHandle<()>)>,
    stopped: bool,
}

impl ProcessSupervisor {
    /// Launch `path` with the opaque `arguments` string.
    ///
    /// Must be called from within a tokio runtime. The argument string is
    /// never logged since it carries stream keys.
    #[instrument(name = "supervisor_start", skip(arguments, options), fields(path = %path.display()))]
    pub fn start(path: &Path, arguments: &str, options: SupervisorOptions) -> ProcessResult<Self> {
        let args = split_arguments(arguments)?;

        let mut command = Command::new(path);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(if options.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        // Own process group so the whole tree can be killed at once.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::LaunchFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let watcher = tokio::spawn(watch_exit(child, pid, kill.clone(), exit_tx));

        info!(pid, args = args.len(), "Encoder started");

        Ok(Self {
            path: path.to_path_buf(),
            pid,
            options,
            stdin,
            stdout,
            stderr,
            exit_rx,
            kill,
            watcher: Some(watcher),
            readers: Vec::new(),
            stopped: false,
        })
    }

    /// Executable the process was launched from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OS process id taken at launch.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the raw frame stream. `None` if not captured or already taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the diagnostic stream.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Exit status, once the process has ended.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Returns true until the exit watcher has seen the process end.
    pub fn is_running(&self) -> bool {
        self.exit_status().is_none()
    }

    /// Receiver that changes to `Some` exactly once, when the process ends.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Register a background reader to be joined on stop.
    pub fn attach_reader(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.readers.push((name, handle));
    }

    /// Stop the process: quit request, bounded wait, then forced kill.
    ///
    /// Never fails. Problems are logged and the sequence carries on, since
    /// this also runs on teardown paths.
    #[instrument(name = "supervisor_stop", skip(self), fields(pid = self.pid))]
    pub async fn stop(&mut self) -> Option<ProcessExit> {
        if self.stopped {
            return self.exit_status();
        }
        self.stopped = true;

        if self.is_running() {
            self.request_quit().await;

            let grace = self.options.grace_period;
            if timeout(grace, self.wait_exit()).await.is_err() {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Encoder did not exit in time, forcing termination"
                );
                self.kill.cancel();
                if timeout(grace, self.wait_exit()).await.is_err() {
                    error!("Encoder still running after forced termination");
                }
            }
        } else {
            self.stdin = None;
        }

        self.join_readers().await;

        if let Some(mut watcher) = self.watcher.take() {
            if timeout(self.options.join_timeout, &mut watcher).await.is_err() {
                warn!("Exit watcher did not finish in time");
                watcher.abort();
            }
        }

        let exit = self.exit_status();
        debug!(?exit, "Encoder stopped");
        exit
    }

    async fn request_quit(&mut self) {
        let Some(mut stdin) = self.stdin.take() else {
            return;
        };

        let write = async {
            stdin.write_all(QUIT_SIGNAL).await?;
            stdin.flush().await
        };

        match timeout(self.options.join_timeout, write).await {
            Ok(Ok(())) => debug!("Quit signal sent"),
            Ok(Err(e)) => debug!("Failed to send quit signal: {}", e),
            Err(_) => debug!("Timed out sending quit signal"),
        }
        // Dropping stdin closes the control pipe.
    }

    async fn wait_exit(&self) -> Option<ProcessExit> {
        let mut exit_rx = self.exit_rx.clone();
        let exit = match exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit
    }

    async fn join_readers(&mut self) {
        for (name, mut handle) in self.readers.drain(..) {
            match timeout(self.options.join_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(reader = name, "Reader joined"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(reader = name, "Reader task failed: {}", e),
                Err(_) => {
                    warn!(reader = name, "Reader did not finish in time");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.stopped {
            self.kill.cancel();
            for (_, handle) in &self.readers {
                handle.abort();
            }
        }
    }
}

async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let natural = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };

    let status = match natural {
        Some(status) => status,
        None => {
            if let Some(pid) = pid {
                kill_tree(pid).await;
            }
            if let Err(e) = child.kill().await {
                debug!(pid, "Kill after tree termination: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from(status),
        Err(e) => {
            error!(pid, "Failed to wait for encoder: {}", e);
            ProcessExit {
                code: None,
                success: false,
            }
        }
    };

    if exit.success {
        debug!(pid, "Encoder exited cleanly");
    } else {
        warn!(pid, code = ?exit.code, "Encoder exited abnormally");
    }

    let _ = exit_tx.send(Some(exit));
}

/// Kill the process and everything it spawned.
#[cfg(unix)]
async fn kill_tree(pid: u32) {
    let group = format!("-{}", pid);
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!(pid, "Process group killed"),
        Ok(status) => debug!(pid, ?status, "Process group kill reported failure"),
        Err(e) => warn!(pid, "Failed to run kill: {}", e),
    }
}

/// Kill the process and everything it spawned.
#[cfg(windows)]
async fn kill_tree(pid: u32) {
    let pid_arg = pid.to_string();
    match Command::new("taskkill")
        .args(["/PID", &pid_arg, "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!(pid, "Process tree killed"),
        Ok(status) => debug!(pid, ?status, "taskkill reported failure"),
        Err(e) => warn!(pid, "Failed to run taskkill: {}", e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::AsyncReadExt;

    const SHELL: &str = "/bin/sh";

    fn options(grace_ms: u64) -> SupervisorOptions {
        SupervisorOptions {
            grace_period: Duration::from_millis(grace_ms),
            join_timeout: Duration::from_millis(500),
            capture_stdout: true,
        }
    }

    #[tokio::test]
    async fn test_graceful_stop_on_quit_signal() {
        let mut supervisor = ProcessSupervisor::start(
            Path::new(SHELL),
            r#"-c "read line; exit 0""#,
            options(3000),
        )
        .unwrap();
        assert!(supervisor.pid().is_some());
        assert!(supervisor.is_running());

        let started = Instant::now();
        let exit = supervisor.stop().await.unwrap();

        assert!(exit.success);
        assert_eq!(exit.code, Some(0));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_forced_stop_after_grace_period() {
        let mut supervisor =
            ProcessSupervisor::start(Path::new(SHELL), r#"-c "sleep 30""#, options(200)).unwrap();

        let started = Instant::now();
        let exit = supervisor.stop().await.unwrap();

        assert!(!exit.success);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_reports_natural_exit() {
        let mut supervisor =
            ProcessSupervisor::start(Path::new(SHELL), r#"-c "exit 3""#, options(1000)).unwrap();

        let mut exit_rx = supervisor.exit_watch();
        let exit = *exit_rx.wait_for(Option::is_some).await.unwrap();
        assert_eq!(exit.map(|e| e.code), Some(Some(3)));

        let exit = supervisor.stop().await.unwrap();
        assert!(!exit.success);
        assert_eq!(exit.code, Some(3));

        // Second stop is a no-op returning the same status.
        assert_eq!(supervisor.stop().await, Some(exit));
    }

    #[tokio::test]
    async fn test_stdout_is_captured() {
        let mut supervisor =
            ProcessSupervisor::start(Path::new(SHELL), r#"-c "printf abc""#, options(1000)).unwrap();

        let mut stdout = supervisor.take_stdout().unwrap();
        let mut output = Vec::new();
        stdout.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"abc");
        assert!(supervisor.take_stdout().is_none());

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_attached_readers_are_joined() {
        let mut supervisor =
            ProcessSupervisor::start(Path::new(SHELL), r#"-c "read line""#, options(1000)).unwrap();

        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        supervisor.attach_reader("stalled", handle);

        let started = Instant::now();
        supervisor.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_missing_binary_fails_to_launch() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let result = ProcessSupervisor::start(
            Path::new("/nonexistent/relaycast/encoder"),
            "-version",
            SupervisorOptions::default(),
        );
        assert!(matches!(result, Err(ProcessError::LaunchFailed { .. })));
    }
}
