use crate::services::safe_exec::{ExecError, ExecOptions, SafeExec};
use nix::sys::signal::Signal;
use std::{path::Path, time::Duration};
use tracing::{debug, warn};

pub const OPTIMISE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lossless PNG recompression through `optipng`.
#[derive(Debug, Clone)]
pub struct ImageOptimiser {
    exec: SafeExec,
    command_prefix: Vec<String>,
    timeout: Duration,
}

impl ImageOptimiser {
    /// `command_prefix` is prepended to every command line, e.g. `nice`.
    pub fn new(exec: SafeExec, command_prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            exec,
            command_prefix,
            timeout,
        }
    }

    /// Optimise `path` in place. A timeout leaves the file as it was.
    pub async fn compress_png(&self, path: &Path) -> Result<(), ExecError> {
        let mut argv = self.command_prefix.clone();
        argv.push("optipng".to_string());
        argv.push(path.to_string_lossy().into_owned());
        let options = ExecOptions {
            timeout: self.timeout,
            kill_signal: Signal::SIGKILL,
            ..Default::default()
        };
        match self.exec.run(&argv, &options).await {
            Ok(output) => {
                debug!(path = %path.display(), output = %output.stdout, "optimised png");
                Ok(())
            }
            Err(err) if err.is_timeout() => {
                warn!(path = %path.display(), "optipng timed out, keeping unoptimised image");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
