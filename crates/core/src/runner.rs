use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
pub struct ScanCancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ScanCancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
}

/// Launches external tool processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CANCEL_GRACE)
    }
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Spawns `program` with piped stdout/stderr.
    ///
    /// stderr is split into lines and forwarded over an unbounded channel,
    /// stdout is drained into memory, and a supervisor task reaps the child.
    /// None of them wait on the consumer, so the child never blocks on a full pipe.
    pub fn spawn(&self, program: &Path, args: &[String]) -> Result<RunningProcess> {
        debug!(program = %program.display(), ?args, "spawning external tool");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => Error::ToolMissing(program.to_path_buf()),
                _ => Error::Io(err),
            })?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_lines(stderr, line_tx)));
        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(err) = stdout.read_to_end(&mut buf).await {
                    debug!(error = %err, "stdout read ended early");
                }
                buf
            })
        });

        let cancel = ScanCancelToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let grace = self.grace;
        let token = cancel.clone();
        let program: PathBuf = program.to_path_buf();

        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let terminated = waited.is_none();
            let status = match waited {
                Some(status) => status,
                None => terminate_child(&mut child, grace).await,
            };
            let _ = exited_tx.send(true);
            debug!(program = %program.display(), ?status, "external tool exited");

            // Orphaned grandchildren may still hold the pipes open after a termination.
            if terminated {
                if let Some(task) = &stderr_task {
                    task.abort();
                }
            }
            let stdout = match stdout_task {
                Some(task) if terminated => {
                    task.abort();
                    Vec::new()
                }
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let _ = exit_tx.send(status.map(|status| ProcessExit {
                code: status.code(),
                stdout,
            }));
        });

        Ok(RunningProcess {
            stderr: line_rx,
            handle: ProcessHandle {
                cancel,
                exited: exited_rx,
            },
            exit: exit_rx,
        })
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Progress bars redraw in place with carriage returns.
                let text = String::from_utf8_lossy(&buf);
                for segment in text.split(['\r', '\n']) {
                    let segment = segment.trim();
                    if !segment.is_empty() {
                        // Keep draining even when nobody listens any more.
                        let _ = tx.send(segment.to_string());
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "stderr read ended early");
                break;
            }
        }
    }
}

async fn terminate_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    if let Err(err) = send_terminate(child) {
        warn!(error = %err, "graceful termination signal failed");
    }
    match timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(grace_secs = grace.as_secs_f64(), "process ignored termination, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

/// Cancellation handle for a spawned process. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    cancel: ScanCancelToken,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    /// Requests termination and waits until the child has been reaped.
    pub async fn terminate(&self) {
        self.cancel.cancel();
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

#[derive(Debug)]
pub struct RunningProcess {
    stderr: mpsc::UnboundedReceiver<String>,
    handle: ProcessHandle,
    exit: oneshot::Receiver<io::Result<ProcessExit>>,
}

impl RunningProcess {
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Next stderr line; `None` once the stream is closed.
    pub async fn next_stderr_line(&mut self) -> Option<String> {
        self.stderr.recv().await
    }

    pub async fn wait(self) -> io::Result<ProcessExit> {
        self.exit
            .await
            .unwrap_or_else(|_| Err(io::Error::other("process supervisor stopped unexpectedly")))
    }
}
