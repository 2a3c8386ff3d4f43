//! Bounded-time execution of external commands.
//!
//! Every command runs in its own process group so that a timeout can signal
//! the whole tree (shell wrappers, converters spawning helpers). A group that
//! ignores the configured signal is escalated to `SIGKILL` after a grace
//! period. Output is collected incrementally and capped per stream. Whatever
//! is left of the group when a run finishes, or when its future is dropped,
//! is killed.

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use std::{
    fmt, io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

/// Bytes kept per output stream; the rest is read and discarded.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Sent to the process group when `timeout` expires.
    pub kill_signal: Signal,
    /// How long the group gets to exit after `kill_signal` before `SIGKILL`.
    pub kill_grace: Duration,
    pub cwd: Option<PathBuf>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            kill_signal: Signal::SIGTERM,
            kill_grace: Duration::from_secs(5),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A command that exited unsuccessfully, was killed, or timed out.
#[derive(Debug, Clone)]
pub struct FailedCommandError {
    pub command: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl fmt::Display for FailedCommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command `{}` failed", self.command)?;
        if self.timed_out {
            write!(f, " after timing out")?;
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, " with exit code {code}"),
            (None, Some(signal)) => write!(f, " with signal {signal}"),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for FailedCommandError {}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("conversions are disabled")]
    Disabled,
    #[error("i/o error running `{command}`")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Failed(#[from] FailedCommandError),
    #[error("failed to send {signal} to process group of `{command}`")]
    KillFailed {
        command: String,
        signal: Signal,
        #[source]
        source: Errno,
    },
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Failed(failed) if failed.timed_out)
    }
}

/// Runs external commands when enabled.
#[derive(Debug, Clone)]
pub struct SafeExec {
    enabled: bool,
}

impl SafeExec {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Run `argv` to completion or until `options.timeout` expires.
    pub async fn run(&self, argv: &[String], options: &ExecOptions) -> Result<ExecOutput, ExecError> {
        if !self.enabled {
            return Err(ExecError::Disabled);
        }
        let command = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::Io {
                command,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Io {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();
        let group = GroupGuard { pid };
        debug!(pid, command = %command, "spawned command");
        let stdout = child.stdout.take().map(|out| tokio::spawn(read_capped(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(read_capped(err)));

        let io_error = |source| ExecError::Io {
            command: command.clone(),
            source,
        };
        let (status, timed_out) = match timeout(options.timeout, child.wait()).await {
            Ok(status) => (status.map_err(io_error)?, false),
            Err(_) => {
                warn!(
                    command = %command,
                    timeout_ms = options.timeout.as_millis() as u64,
                    signal = %options.kill_signal,
                    "command timed out, killing process group"
                );
                signal_group(&command, pid, options.kill_signal)?;
                let status = match timeout(options.kill_grace, child.wait()).await {
                    Ok(status) => status.map_err(io_error)?,
                    Err(_) => {
                        warn!(command = %command, "process group survived, escalating to SIGKILL");
                        signal_group(&command, pid, Signal::SIGKILL)?;
                        child.wait().await.map_err(io_error)?
                    }
                };
                (status, true)
            }
        };

        // stragglers would otherwise hold the output pipes open
        drop(group);
        let stdout = collect_output(stdout, options.kill_grace).await;
        let stderr = collect_output(stderr, options.kill_grace).await;
        if status.success() && !timed_out {
            return Ok(ExecOutput { stdout, stderr });
        }
        Err(failure(command, status, stdout, stderr, timed_out).into())
    }
}

fn failure(
    command: String,
    status: ExitStatus,
    stdout: String,
    stderr: String,
    timed_out: bool,
) -> FailedCommandError {
    FailedCommandError {
        command,
        code: status.code(),
        signal: status.signal(),
        stdout,
        stderr,
        timed_out,
    }
}

/// Signal the group led by `pid`. A group that is already gone is fine.
fn signal_group(command: &str, pid: Option<u32>, signal: Signal) -> Result<(), ExecError> {
    let Some(pid) = pid else {
        return Ok(());
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(ExecError::KillFailed {
            command: command.to_string(),
            signal,
            source,
        }),
    }
}

/// Sends `SIGKILL` to the process group when dropped.
struct GroupGuard {
    pid: Option<u32>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid, "killed remaining process group"),
            Err(Errno::ESRCH) => {}
            Err(err) => warn!(pid, error = %err, "failed to kill process group"),
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_OUTPUT_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Output of a reader task; a pipe held open by an escaped descendant is
/// abandoned after `wait`.
async fn collect_output(handle: Option<JoinHandle<String>>, wait: Duration) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match timeout(wait, handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}
