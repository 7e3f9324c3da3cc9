//! Advisory lock tied to a pipeline identity.
//!
//! A `Running` record may only ever be produced by the process holding this
//! lock, and the rollback manager may only repair state while no
//! orchestrator is active. Both are enforced by a PID-stamped lock file
//! created with `create_new` semantics and released on drop.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while acquiring the pipeline lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock for this pipeline identity.
    #[error("Pipeline lock {} is held by pid {}", .path.display(), .owner.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    Held { path: PathBuf, owner: Option<u32> },

    /// Failed to create or inspect the lock file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive advisory lock for one pipeline identity.
///
/// Released when dropped. A lock file whose recorded owner PID is no longer
/// alive is treated as stale and reclaimed.
#[derive(Debug)]
pub struct PipelineLock {
    path: PathBuf,
}

impl PipelineLock {
    /// Acquires the lock for a pipeline identity in the given directory.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Held` if a live process already owns the lock.
    pub fn acquire(dir: &Path, pipeline_id: &str) -> Result<Self, LockError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{pipeline_id}.lock"));

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(pipeline = pipeline_id, path = %path.display(), "Lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let owner = read_owner(&path);
                    if attempt == 0 && owner.map(|pid| !process_alive(pid)).unwrap_or(false) {
                        warn!(
                            pipeline = pipeline_id,
                            owner = owner,
                            "Reclaiming stale lock from dead process"
                        );
                        fs::remove_file(&path)?;
                        continue;
                    }
                    return Err(LockError::Held { path, owner });
                }
                Err(e) => return Err(LockError::Io(e)),
            }
        }
        Err(LockError::Held {
            path,
            owner: None,
        })
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

/// Reads the owner PID recorded in a lock file.
fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Checks whether a process is still alive.
///
/// On Linux this probes `/proc/<pid>`; elsewhere an existing lock is always
/// treated as held.
fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}
