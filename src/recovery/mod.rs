//! Rollback to the last known-good state before a run begins.
//!
//! The rollback manager repairs what an unclean death leaves behind: a
//! corrupt primary record (restored from backup), `Running` records whose
//! step died mid-execution (downgraded, partial outputs discarded), and
//! `Completed` records whose artifacts no longer verify (downgraded).
//! Invalidation propagates transitively through the graph so a dependent is
//! never left `Completed` on top of an invalidated dependency. The
//! reconciled state is committed atomically before control returns —
//! rollback is eager, never deferred.

use std::collections::BTreeSet;
use std::fs;
use std::io;

use thiserror::Error;
use tracing::{info, warn};

use crate::checksum::{ChecksumAlgorithm, ChecksumError};
use crate::graph::StepGraph;
use crate::state::{LockError, PipelineLock, PipelineState, StateStore, StepStatus, StoreError};

/// Errors that can occur during state reconciliation.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Neither the primary record nor its backup is structurally valid.
    /// Surfaced to the operator; recovery never silently loses data.
    #[error("State for pipeline '{pipeline}' is unrecoverable: {reason}")]
    Unrecoverable { pipeline: String, reason: String },

    /// The state store failed for a reason other than corruption.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Artifact verification failed to read the filesystem.
    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    /// Failed to discard a partial output artifact.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The pipeline lock could not be acquired.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

/// Repairs persisted state before planning begins.
pub struct RollbackManager {
    store: StateStore,
    algorithm: ChecksumAlgorithm,
}

impl RollbackManager {
    /// Creates a rollback manager over the given store.
    pub fn new(store: StateStore, algorithm: ChecksumAlgorithm) -> Self {
        Self { store, algorithm }
    }

    /// Acquires the pipeline lock and reconciles.
    ///
    /// The rollback manager may only write while no orchestrator is
    /// active; callers already holding the lock use
    /// [`reconcile_locked`](Self::reconcile_locked) instead.
    pub fn reconcile(&self, graph: &StepGraph) -> Result<PipelineState, RecoveryError> {
        let _lock = PipelineLock::acquire(self.store.dir(), graph.pipeline())?;
        self.reconcile_locked(graph)
    }

    /// Reconciles persisted state against the graph and the filesystem.
    ///
    /// Caller must hold the pipeline lock.
    pub fn reconcile_locked(&self, graph: &StepGraph) -> Result<PipelineState, RecoveryError> {
        let pipeline = graph.pipeline();
        let (mut state, recovered_from_backup) = match self.store.load(pipeline) {
            Ok(state) => (state, false),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(
                    pipeline,
                    reason = %reason,
                    "Primary state record is corrupt; trying backup"
                );
                match self.store.load_backup(pipeline) {
                    Ok(Some(backup)) => {
                        info!(
                            pipeline,
                            generation = backup.generation,
                            "Restored state from backup"
                        );
                        (backup, true)
                    }
                    Ok(None) => {
                        return Err(RecoveryError::Unrecoverable {
                            pipeline: pipeline.to_string(),
                            reason: format!("primary record corrupt ({reason}), no backup exists"),
                        })
                    }
                    Err(StoreError::Corrupt {
                        reason: backup_reason,
                        ..
                    }) => {
                        return Err(RecoveryError::Unrecoverable {
                            pipeline: pipeline.to_string(),
                            reason: format!(
                                "primary record corrupt ({reason}), backup corrupt ({backup_reason})"
                            ),
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let mut invalidated: BTreeSet<String> = BTreeSet::new();
        for step in graph.topo_steps() {
            let id = step.id.as_str();

            // Corruption propagates forward: a dependent of an invalidated
            // step is downgraded regardless of its own record.
            if step.deps.iter().any(|d| invalidated.contains(d)) {
                if state.status(id) != StepStatus::Pending {
                    info!(step = id, "Downgrading dependent of invalidated step");
                    state.step_mut(id).downgrade();
                }
                invalidated.insert(id.to_string());
                continue;
            }

            match state.status(id) {
                StepStatus::Completed => {
                    if !self.outputs_verify(step, &state)? {
                        warn!(
                            step = id,
                            "Completed step failed artifact verification; downgrading"
                        );
                        state.step_mut(id).downgrade();
                        invalidated.insert(id.to_string());
                    }
                }
                StepStatus::Running => {
                    // The previous run died mid-step; partial output
                    // cannot be trusted.
                    warn!(
                        step = id,
                        "Step was mid-execution at last shutdown; discarding partial outputs"
                    );
                    self.discard_outputs(step)?;
                    state.step_mut(id).downgrade();
                    invalidated.insert(id.to_string());
                }
                StepStatus::Pending | StepStatus::Failed => {}
            }
        }

        if invalidated.is_empty() && !recovered_from_backup {
            info!(pipeline, "State is consistent; nothing to reconcile");
            return Ok(state);
        }

        // Every surviving completion was just verified against its
        // artifacts, so this commit is a consistent snapshot.
        state.last_consistent_generation = state.generation + 1;
        let state = self.store.commit(state)?;
        info!(
            pipeline,
            downgraded = invalidated.len(),
            generation = state.generation,
            "Reconciled state committed"
        );
        Ok(state)
    }

    /// Checks a completed step's declared outputs against its record.
    fn outputs_verify(
        &self,
        step: &crate::graph::StepSpec,
        state: &PipelineState,
    ) -> Result<bool, RecoveryError> {
        let record = match state.step(&step.id) {
            Some(record) => record,
            None => return Ok(false),
        };
        let expected = match &record.output_checksum {
            Some(expected) => expected,
            None => return Ok(false),
        };
        if step.output_paths().iter().any(|p| !p.exists()) {
            return Ok(false);
        }
        let actual = step.output_digest(self.algorithm)?;
        Ok(actual == *expected)
    }

    /// Deletes a step's declared outputs, files or directories.
    fn discard_outputs(&self, step: &crate::graph::StepSpec) -> Result<(), RecoveryError> {
        for path in step.output_paths() {
            if !path.exists() {
                continue;
            }
            if path.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
