//! Cooperative, graded shutdown for pipeline runs.
//!
//! Termination is never an abrupt thread interruption: the first signal
//! marks intent-to-stop and lets the in-flight step reach a terminal
//! per-step status before the run ends with an `Interrupted` phase; a
//! second signal upgrades to a hard abort, killing the in-flight command
//! and leaving the last atomically-committed state as the recovery point.
//! State is only ever written at step-sized commit boundaries, so neither
//! grade can corrupt the store.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Phase of a single orchestrator run.
///
/// `Interrupted` is terminal for the run, not for the pipeline identity:
/// a later invocation resumes normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// No run in progress.
    Idle,
    /// Steps are being planned and executed.
    Running,
    /// Every planned step resolved to skip or success.
    Completed,
    /// The run stopped at a safe boundary after a termination request.
    Interrupted,
    /// At least one step failed or was blocked.
    Failed,
}

impl RunPhase {
    fn from_u8(value: u8) -> RunPhase {
        match value {
            1 => RunPhase::Running,
            2 => RunPhase::Completed,
            3 => RunPhase::Interrupted,
            4 => RunPhase::Failed,
            _ => RunPhase::Idle,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Idle => write!(f, "idle"),
            RunPhase::Running => write!(f, "running"),
            RunPhase::Completed => write!(f, "completed"),
            RunPhase::Interrupted => write!(f, "interrupted"),
            RunPhase::Failed => write!(f, "failed"),
        }
    }
}

struct Inner {
    soft_tx: broadcast::Sender<()>,
    hard_tx: broadcast::Sender<()>,
    phase: AtomicU8,
    signals_seen: AtomicU32,
}

/// Coordinates graceful and hard shutdown across the orchestrator and the
/// in-flight executor.
///
/// Cloning shares the same underlying channels and counters.
#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// Creates a controller in the `Idle` phase.
    pub fn new() -> Self {
        // Buffer of 1 is enough: each channel only ever carries one event.
        let (soft_tx, _) = broadcast::channel(1);
        let (hard_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                soft_tx,
                hard_tx,
                phase: AtomicU8::new(0),
                signals_seen: AtomicU32::new(0),
            }),
        }
    }

    /// Returns the current run phase.
    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    /// Records a phase transition.
    pub fn set_phase(&self, phase: RunPhase) {
        self.inner.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Requests a graceful stop at the next step boundary.
    pub fn request_stop(&self) {
        // Ignore send errors: no receiver just means nothing is mid-step.
        let _ = self.inner.soft_tx.send(());
        info!("Stop requested; finishing the in-flight step before exiting");
    }

    /// Requests an immediate abort of the in-flight step.
    pub fn request_abort(&self) {
        let _ = self.inner.hard_tx.send(());
        warn!("Hard abort requested; killing the in-flight step");
    }

    /// Returns whether a graceful stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.inner.signals_seen.load(Ordering::SeqCst) >= 1
    }

    /// Returns whether a hard abort has been requested.
    pub fn abort_requested(&self) -> bool {
        self.inner.signals_seen.load(Ordering::SeqCst) >= 2
    }

    /// Subscribes to the hard-abort channel.
    pub fn subscribe_abort(&self) -> broadcast::Receiver<()> {
        self.inner.hard_tx.subscribe()
    }

    /// Handles one received termination signal, grading the response.
    pub fn on_signal(&self) {
        let seen = self.inner.signals_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == 1 {
            self.request_stop();
        } else {
            self.request_abort();
        }
    }

    /// Spawns the SIGINT listener for this controller.
    ///
    /// First signal: graceful stop. Second signal: hard abort, after which
    /// the listener exits.
    pub fn install_signal_handler(&self) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for termination signal");
                    return;
                }
                controller.on_signal();
                if controller.abort_requested() {
                    return;
                }
            }
        })
    }
}
