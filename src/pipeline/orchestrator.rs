//! Pipeline orchestrator: drives the step graph against the state store.
//!
//! The orchestrator owns the normal-operation write path: for every `Run`
//! decision it commits `Running`, invokes the step's executable unit,
//! then commits `Completed` (with the output checksum) or `Failed`. All
//! writes happen at step-sized commit boundaries through the
//! generation-checked store, so an interruption at any point leaves either
//! the previous or the next fully-committed state — never a mix.
//!
//! There is no separate resume path: a run always loads existing state and
//! plans over it. Recovery (`RunMode::Resume`) and from-scratch runs
//! (`RunMode::Fresh`) differ only in what happens before planning.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checksum::ChecksumError;
use crate::graph::{plan, StepDecision, StepGraph};
use crate::recovery::{RecoveryError, RollbackManager};
use crate::shutdown::{RunPhase, ShutdownController};
use crate::state::{LockError, PipelineLock, PipelineState, StateStore, StoreError};

use super::config::{ConfigError, OrchestratorConfig};
use super::executor::{ExecError, StepExecutor};

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The pipeline lock could not be acquired.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Artifact hashing failed.
    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    /// Pre-run reconciliation failed.
    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// Concurrent writes kept conflicting past the configured retry bound.
    /// Two orchestrators racing on one identity is an operator error, not
    /// a transient condition.
    #[error("State write conflict persisted after {attempts} retries; is another orchestrator running against this pipeline?")]
    ConflictExhausted { attempts: u32 },
}

/// How a run treats existing state before planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Reconcile persisted state (rollback) before planning.
    Resume,
    /// Plan directly over persisted state without repair.
    NoReconcile,
    /// Clear persisted state and run everything from scratch.
    Fresh,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Resume => write!(f, "resume"),
            RunMode::NoReconcile => write!(f, "no-reconcile"),
            RunMode::Fresh => write!(f, "fresh"),
        }
    }
}

/// Summary of a finished (or stopped) pipeline run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Pipeline identity.
    pub pipeline: String,
    /// Terminal phase of the run.
    pub phase: RunPhase,
    /// Final per-step resolution, in planning order.
    pub decisions: Vec<StepDecision>,
    /// Steps executed to successful completion.
    pub executed: usize,
    /// Steps skipped because their outputs verified.
    pub skipped: usize,
    /// Steps that ran and failed.
    pub failed: usize,
    /// Steps blocked by a failed dependency.
    pub blocked: usize,
    /// Planned runs never reached because the run stopped early.
    pub not_reached: usize,
    /// Wall-clock duration of the run in seconds.
    pub duration_secs: f64,
}

/// Coordinates planning, execution, and state commits for one pipeline.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: StateStore,
    executor: Arc<dyn StepExecutor>,
    shutdown: ShutdownController,
}

impl Orchestrator {
    /// Creates an orchestrator with the given configuration and executor.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn StepExecutor>,
        shutdown: ShutdownController,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = StateStore::new(&config.state_dir);
        Ok(Self {
            config,
            store,
            executor,
            shutdown,
        })
    }

    /// Returns the state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Plans over current state without executing anything.
    ///
    /// Read-only: no lock is taken and no state is written.
    pub fn plan_preview(&self, graph: &StepGraph) -> Result<Vec<StepDecision>, PipelineError> {
        let state = self.store.load(graph.pipeline())?;
        Ok(plan(graph, &state, self.config.checksum_algorithm)?)
    }

    /// Runs the pipeline to a terminal phase.
    ///
    /// Holds the pipeline lock for the whole run, including the
    /// reconciliation pass, so the rollback manager and the orchestrator
    /// can never write concurrently.
    pub async fn run(&self, graph: &StepGraph, mode: RunMode) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let _lock = PipelineLock::acquire(&self.config.state_dir, graph.pipeline())?;

        self.shutdown.set_phase(RunPhase::Running);
        info!(
            run_id = %run_id,
            pipeline = graph.pipeline(),
            mode = %mode,
            steps = graph.len(),
            "Pipeline run starting"
        );

        match mode {
            RunMode::Fresh => {
                info!(pipeline = graph.pipeline(), "Clearing state for a from-scratch run");
                self.store.clear(graph.pipeline())?;
            }
            RunMode::Resume => {
                let rollback =
                    RollbackManager::new(self.store.clone(), self.config.checksum_algorithm);
                rollback.reconcile_locked(graph)?;
            }
            RunMode::NoReconcile => {}
        }

        let mut state = self.store.load(graph.pipeline())?;
        let planned = plan(graph, &state, self.config.checksum_algorithm)?;

        let mut resolved = Vec::with_capacity(planned.len());
        let mut failed_steps: HashSet<String> = HashSet::new();
        let mut executed = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        let mut blocked = 0usize;
        let mut not_reached = 0usize;
        let mut stopping = false;
        let mut aborted = false;

        for decision in planned {
            if stopping || aborted {
                if decision.is_run() {
                    not_reached += 1;
                } else {
                    skipped += 1;
                }
                resolved.push(decision);
                continue;
            }

            match decision {
                StepDecision::Skip { step } => {
                    debug!(step = %step, "Skipping step with verified outputs");
                    skipped += 1;
                    resolved.push(StepDecision::Skip { step });
                }
                StepDecision::Blocked { step, reason } => {
                    blocked += 1;
                    failed_steps.insert(step.clone());
                    resolved.push(StepDecision::Blocked { step, reason });
                }
                StepDecision::Run { step: id, reason } => {
                    let spec = graph.step(&id).expect("planned step exists in graph");

                    if let Some(dep) = spec.deps.iter().find(|d| failed_steps.contains(d.as_str()))
                    {
                        warn!(step = %id, dependency = %dep, "Step blocked by failed dependency");
                        failed_steps.insert(id.clone());
                        blocked += 1;
                        resolved.push(StepDecision::Blocked {
                            step: id,
                            reason: format!("dependency '{dep}' did not succeed"),
                        });
                        continue;
                    }

                    state = self
                        .commit_with_retry(state, |s| s.step_mut(&id).mark_running())
                        .await?;
                    let attempt = state.step(&id).map(|r| r.attempt_count).unwrap_or(1);
                    info!(step = %id, reason = %reason, attempt, "Executing step");

                    match self.executor.execute(spec, &self.shutdown).await {
                        Ok(()) => {
                            if let Some(missing) =
                                spec.output_paths().into_iter().find(|p| !p.exists())
                            {
                                let detail = format!(
                                    "declared output '{}' missing after successful exit",
                                    missing.display()
                                );
                                error!(step = %id, detail = %detail, "Step output contract violated");
                                state = self
                                    .commit_with_retry(state, |s| {
                                        s.step_mut(&id).mark_failed(detail.clone())
                                    })
                                    .await?;
                                failed_steps.insert(id.clone());
                                failed += 1;
                            } else {
                                let digest =
                                    spec.output_digest(self.config.checksum_algorithm)?;
                                state = self
                                    .commit_with_retry(state, |s| {
                                        s.step_mut(&id).mark_completed(digest.clone());
                                        // This commit's generation: the bump
                                        // is exactly 1.
                                        s.last_consistent_generation = s.generation + 1;
                                    })
                                    .await?;
                                info!(step = %id, "Step completed");
                                executed += 1;
                            }
                            resolved.push(StepDecision::Run { step: id, reason });
                        }
                        Err(ExecError::Aborted) => {
                            // Hard abort: nothing is written past the last
                            // commit; the Running record is reconciled on
                            // the next invocation.
                            warn!(step = %id, "Run aborted mid-step");
                            aborted = true;
                            not_reached += 1;
                            resolved.push(StepDecision::Run { step: id, reason });
                        }
                        Err(e) => {
                            error!(step = %id, error = %e, "Step failed");
                            state = self
                                .commit_with_retry(state, |s| {
                                    s.step_mut(&id).mark_failed(e.to_string())
                                })
                                .await?;
                            failed_steps.insert(id.clone());
                            failed += 1;
                            resolved.push(StepDecision::Run { step: id, reason });
                        }
                    }

                    if !aborted && self.shutdown.stop_requested() {
                        info!("Stop request honored at step boundary");
                        stopping = true;
                    }
                }
            }
        }

        let phase = if aborted || stopping {
            RunPhase::Interrupted
        } else if failed > 0 || blocked > 0 {
            RunPhase::Failed
        } else {
            RunPhase::Completed
        };
        self.shutdown.set_phase(phase);

        info!(
            run_id = %run_id,
            phase = %phase,
            executed,
            skipped,
            failed,
            blocked,
            not_reached,
            "Pipeline run finished"
        );

        Ok(RunReport {
            run_id,
            pipeline: graph.pipeline().to_string(),
            phase,
            decisions: resolved,
            executed,
            skipped,
            failed,
            blocked,
            not_reached,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Commits a mutation, retrying conflicted writes with fresh reads.
    ///
    /// The mutation is re-applied to each freshly loaded state, so a retry
    /// never clobbers another writer's committed changes.
    async fn commit_with_retry<F>(
        &self,
        state: PipelineState,
        mutate: F,
    ) -> Result<PipelineState, PipelineError>
    where
        F: Fn(&mut PipelineState),
    {
        let pipeline = state.pipeline.clone();
        let mut base = state;
        let mut attempts = 0u32;
        loop {
            let mut candidate = base.clone();
            mutate(&mut candidate);
            match self.store.commit(candidate) {
                Ok(committed) => return Ok(committed),
                Err(StoreError::Conflict { expected, actual }) => {
                    attempts += 1;
                    if attempts > self.config.max_conflict_retries {
                        return Err(PipelineError::ConflictExhausted {
                            attempts: attempts - 1,
                        });
                    }
                    warn!(
                        pipeline = %pipeline,
                        expected,
                        actual,
                        attempt = attempts,
                        "State write conflict; retrying with a fresh read"
                    );
                    let jitter = rand::rng().random_range(10..=60);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    base = self.store.load(&pipeline)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
