//! External executable units for pipeline steps.
//!
//! Each step names a shell command; the orchestrator invokes it through the
//! [`StepExecutor`] seam and only observes its exit status. The default
//! [`ProcessExecutor`] runs commands via `sh -c` with the step's
//! environment and working directory, an optional wall-clock timeout, and a
//! hard-abort path wired to the shutdown controller. A graceful stop never
//! touches the in-flight command: it runs to its own terminal status.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::graph::StepSpec;
use crate::shutdown::ShutdownController;

/// Errors that can occur while executing a step's command.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command could not be spawned.
    #[error("Failed to spawn step command: {0}")]
    Spawn(std::io::Error),

    /// The command exited with a non-zero status.
    #[error("Step command exited with non-zero code {code}")]
    NonZeroExit { code: i32 },

    /// The command was terminated by a signal outside our control.
    #[error("Step command terminated by signal")]
    Signalled,

    /// The command exceeded the configured timeout.
    #[error("Step execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// The command was killed by a hard abort request.
    #[error("Step execution aborted by shutdown request")]
    Aborted,

    /// IO failure while supervising the command.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes one step's external unit to a terminal status.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs the step's executable unit.
    ///
    /// Implementations must honor the controller's hard-abort channel by
    /// terminating promptly; the graceful-stop grade is handled by the
    /// orchestrator at step boundaries and never interrupts execution.
    async fn execute(
        &self,
        step: &StepSpec,
        shutdown: &ShutdownController,
    ) -> Result<(), ExecError>;
}

/// Runs step commands as local child processes via `sh -c`.
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    /// Creates an executor with an optional per-step timeout.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
    async fn execute(
        &self,
        step: &StepSpec,
        shutdown: &ShutdownController,
    ) -> Result<(), ExecError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&step.command);
        command.envs(&step.env);
        if let Some(workdir) = &step.workdir {
            command.current_dir(workdir);
        }
        command.kill_on_drop(true);

        debug!(step = %step.id, command = %step.command, "Spawning step command");
        let mut child = command.spawn().map_err(ExecError::Spawn)?;
        let mut abort_rx = shutdown.subscribe_abort();

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else if let Some(code) = status.code() {
                    Err(ExecError::NonZeroExit { code })
                } else {
                    Err(ExecError::Signalled)
                }
            }
            _ = deadline => {
                warn!(step = %step.id, "Step timed out; killing command");
                let _ = child.kill().await;
                Err(ExecError::Timeout {
                    seconds: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                })
            }
            _ = abort_rx.recv() => {
                warn!(step = %step.id, "Hard abort; killing in-flight command");
                let _ = child.kill().await;
                Err(ExecError::Aborted)
            }
        }
    }
}

/// Returns the most recently modified entry in a checkpoint directory.
///
/// Training steps describe their own checkpoints; the orchestrator only
/// points at the latest one and never interprets its contents. A missing
/// or empty directory yields `None`.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>, std::io::Error> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let modified = entry.metadata()?.modified()?;
        let newer = latest
            .as_ref()
            .map(|(stamp, _)| modified > *stamp)
            .unwrap_or(true);
        if newer {
            latest = Some((modified, entry.path()));
        }
    }
    Ok(latest.map(|(_, path)| path))
}
