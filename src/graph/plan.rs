//! Deterministic skip/run planning over a step graph and persisted state.
//!
//! Resuming a pipeline is nothing but `load` + `plan` again: planning is
//! idempotent and purely state-driven, so there is no separate resume code
//! path. Checksum mismatches and missing artifacts are decidable planning
//! inputs that self-heal into `Run` decisions; a mismatch on a recorded
//! completion is additionally surfaced as a detected-drift warning.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::checksum::{ChecksumAlgorithm, ChecksumError};
use crate::state::{PipelineState, StepStatus};

use super::step::StepGraph;

/// Why a step was planned to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    /// The step is pending: never completed, or downgraded by recovery.
    Pending,
    /// The step failed on a previous attempt.
    PreviousFailure,
    /// A `Running` record survived from a run that died mid-step.
    UncleanShutdown,
    /// A declared output artifact no longer exists.
    OutputMissing,
    /// A declared output exists but its content no longer matches the
    /// recorded checksum.
    OutputDrift,
    /// A dependency is being re-run, so this step's inputs are stale.
    StaleInputs,
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::Pending => write!(f, "pending"),
            RunReason::PreviousFailure => write!(f, "previous failure"),
            RunReason::UncleanShutdown => write!(f, "unclean shutdown"),
            RunReason::OutputMissing => write!(f, "output missing"),
            RunReason::OutputDrift => write!(f, "output drift"),
            RunReason::StaleInputs => write!(f, "stale inputs"),
        }
    }
}

/// Planning outcome for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum StepDecision {
    /// The step is `Completed` and its declared outputs still verify.
    Skip { step: String },
    /// The step must execute (or re-execute).
    Run { step: String, reason: RunReason },
    /// A dependency did not resolve to success during execution.
    Blocked { step: String, reason: String },
}

impl StepDecision {
    /// Returns the step id this decision is about.
    pub fn step_id(&self) -> &str {
        match self {
            StepDecision::Skip { step }
            | StepDecision::Run { step, .. }
            | StepDecision::Blocked { step, .. } => step,
        }
    }

    /// Returns whether this is a `Run` decision.
    pub fn is_run(&self) -> bool {
        matches!(self, StepDecision::Run { .. })
    }

    /// Returns whether this is a `Skip` decision.
    pub fn is_skip(&self) -> bool {
        matches!(self, StepDecision::Skip { .. })
    }
}

impl fmt::Display for StepDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepDecision::Skip { step } => write!(f, "skip {step}"),
            StepDecision::Run { step, reason } => write!(f, "run {step} ({reason})"),
            StepDecision::Blocked { step, reason } => write!(f, "blocked {step}: {reason}"),
        }
    }
}

/// Plans one decision per step, in deterministic topological order.
///
/// A dependent of a step planned `Run` is itself planned `Run` even when
/// its own outputs verify: its inputs are about to change, and skipping it
/// would leave the end-to-end property (§ delete one output, all dependents
/// re-run) holding only behind a reconcile pass.
///
/// # Errors
///
/// Returns `ChecksumError` only for genuine read failures while hashing;
/// missing artifacts and mismatches are decisions, not errors.
pub fn plan(
    graph: &StepGraph,
    state: &PipelineState,
    algorithm: ChecksumAlgorithm,
) -> Result<Vec<StepDecision>, ChecksumError> {
    let mut decisions = Vec::with_capacity(graph.len());
    let mut will_run: HashSet<&str> = HashSet::new();

    for step in graph.topo_steps() {
        let id = step.id.as_str();

        if step.deps.iter().any(|d| will_run.contains(d.as_str())) {
            will_run.insert(id);
            decisions.push(StepDecision::Run {
                step: id.to_string(),
                reason: RunReason::StaleInputs,
            });
            continue;
        }

        let decision = match state.status(id) {
            StepStatus::Pending => StepDecision::Run {
                step: id.to_string(),
                reason: RunReason::Pending,
            },
            StepStatus::Failed => StepDecision::Run {
                step: id.to_string(),
                reason: RunReason::PreviousFailure,
            },
            StepStatus::Running => {
                warn!(
                    step = id,
                    "Found running record from a previous run; re-executing"
                );
                StepDecision::Run {
                    step: id.to_string(),
                    reason: RunReason::UncleanShutdown,
                }
            }
            StepStatus::Completed => {
                let record = state.step(id).expect("completed step has a record");
                match &record.output_checksum {
                    None => StepDecision::Run {
                        step: id.to_string(),
                        reason: RunReason::OutputMissing,
                    },
                    Some(expected) => {
                        if step.output_paths().iter().any(|p| !p.exists()) {
                            StepDecision::Run {
                                step: id.to_string(),
                                reason: RunReason::OutputMissing,
                            }
                        } else {
                            let actual = step.output_digest(algorithm)?;
                            if actual == *expected {
                                StepDecision::Skip {
                                    step: id.to_string(),
                                }
                            } else {
                                warn!(
                                    step = id,
                                    expected = %expected,
                                    actual = %actual,
                                    "Output drift detected; re-executing"
                                );
                                StepDecision::Run {
                                    step: id.to_string(),
                                    reason: RunReason::OutputDrift,
                                }
                            }
                        }
                    }
                }
            }
        };

        if decision.is_run() {
            will_run.insert(id);
        }
        decisions.push(decision);
    }

    debug!(
        pipeline = graph.pipeline(),
        total = decisions.len(),
        runs = decisions.iter().filter(|d| d.is_run()).count(),
        "Plan computed"
    );
    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumValidator;
    use crate::graph::step::StepSpec;
    use std::fs;
    use tempfile::TempDir;

    fn graph_with_outputs(dir: &std::path::Path) -> StepGraph {
        let steps = vec![
            StepSpec::new("download", "true").with_output(dir.join("raw")),
            StepSpec::new("preprocess", "true")
                .with_dep("download")
                .with_output(dir.join("clean")),
            StepSpec::new("validate", "true")
                .with_dep("preprocess")
                .with_output(dir.join("report")),
            StepSpec::new("train", "true")
                .with_dep("validate")
                .with_output(dir.join("model")),
        ];
        StepGraph::new("research", steps).unwrap()
    }

    fn complete_step(state: &mut PipelineState, graph: &StepGraph, id: &str, content: &[u8]) {
        let step = graph.step(id).unwrap();
        fs::write(&step.outputs[0].path, content).unwrap();
        state.step_mut(id).mark_running();
        let digest = step.output_digest(ChecksumAlgorithm::Sha256).unwrap();
        state.step_mut(id).mark_completed(digest);
    }

    #[test]
    fn test_fresh_state_plans_all_runs() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let graph = graph_with_outputs(temp_dir.path());
        let state = PipelineState::new("research");

        let decisions = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(decisions.len(), 4);
        assert!(decisions.iter().all(|d| d.is_run()));
        assert!(matches!(
            &decisions[0],
            StepDecision::Run { reason: RunReason::Pending, .. }
        ));
    }

    #[test]
    fn test_plan_is_idempotent_after_completion() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let graph = graph_with_outputs(temp_dir.path());
        let mut state = PipelineState::new("research");
        for id in ["download", "preprocess", "validate", "train"] {
            complete_step(&mut state, &graph, id, id.as_bytes());
        }

        let first = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert!(first.iter().all(|d| d.is_skip()));

        // No external change: the second plan is identical.
        let second = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_deleted_output_reruns_step_and_all_dependents() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let graph = graph_with_outputs(temp_dir.path());
        let mut state = PipelineState::new("research");
        for id in ["download", "preprocess", "validate", "train"] {
            complete_step(&mut state, &graph, id, id.as_bytes());
        }

        fs::remove_file(temp_dir.path().join("clean")).unwrap();

        let decisions = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            decisions[0],
            StepDecision::Skip {
                step: "download".to_string()
            }
        );
        assert_eq!(
            decisions[1],
            StepDecision::Run {
                step: "preprocess".to_string(),
                reason: RunReason::OutputMissing
            }
        );
        assert_eq!(
            decisions[2],
            StepDecision::Run {
                step: "validate".to_string(),
                reason: RunReason::StaleInputs
            }
        );
        assert_eq!(
            decisions[3],
            StepDecision::Run {
                step: "train".to_string(),
                reason: RunReason::StaleInputs
            }
        );
    }

    #[test]
    fn test_out_of_band_mutation_is_drift_not_skip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let graph = graph_with_outputs(temp_dir.path());
        let mut state = PipelineState::new("research");
        for id in ["download", "preprocess", "validate", "train"] {
            complete_step(&mut state, &graph, id, id.as_bytes());
        }

        fs::write(temp_dir.path().join("raw"), b"tampered").unwrap();

        let decisions = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            decisions[0],
            StepDecision::Run {
                step: "download".to_string(),
                reason: RunReason::OutputDrift
            }
        );
        assert!(decisions.iter().all(|d| d.is_run()));
    }

    #[test]
    fn test_failed_step_reruns() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let graph = graph_with_outputs(temp_dir.path());
        let mut state = PipelineState::new("research");
        complete_step(&mut state, &graph, "download", b"raw");
        state.step_mut("preprocess").mark_running();
        state.step_mut("preprocess").mark_failed("exit status 2");

        let decisions = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert!(decisions[0].is_skip());
        assert_eq!(
            decisions[1],
            StepDecision::Run {
                step: "preprocess".to_string(),
                reason: RunReason::PreviousFailure
            }
        );
    }

    #[test]
    fn test_running_leftover_reruns_as_unclean_shutdown() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let graph = graph_with_outputs(temp_dir.path());
        let mut state = PipelineState::new("research");
        complete_step(&mut state, &graph, "download", b"raw");
        state.step_mut("preprocess").mark_running();

        let decisions = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            decisions[1],
            StepDecision::Run {
                step: "preprocess".to_string(),
                reason: RunReason::UncleanShutdown
            }
        );
    }

    #[test]
    fn test_independent_branch_is_not_invalidated() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let steps = vec![
            StepSpec::new("left", "true").with_output(temp_dir.path().join("left.out")),
            StepSpec::new("right", "true").with_output(temp_dir.path().join("right.out")),
            StepSpec::new("join", "true")
                .with_dep("left")
                .with_dep("right")
                .with_output(temp_dir.path().join("join.out")),
        ];
        let graph = StepGraph::new("diamond", steps).unwrap();
        let mut state = PipelineState::new("diamond");
        for id in ["left", "right", "join"] {
            complete_step(&mut state, &graph, id, id.as_bytes());
        }

        fs::remove_file(temp_dir.path().join("left.out")).unwrap();

        let decisions = plan(&graph, &state, ChecksumAlgorithm::Sha256).unwrap();
        let by_id = |id: &str| {
            decisions
                .iter()
                .find(|d| d.step_id() == id)
                .unwrap()
                .clone()
        };
        assert!(by_id("left").is_run());
        assert!(by_id("right").is_skip());
        assert!(matches!(
            by_id("join"),
            StepDecision::Run { reason: RunReason::StaleInputs, .. }
        ));
    }

    #[test]
    fn test_validator_and_planner_agree_on_digests() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("artifact");
        fs::write(&path, b"payload").unwrap();

        let step = StepSpec::new("s", "true").with_output(&path);
        let digest = step.output_digest(ChecksumAlgorithm::Sha256).unwrap();
        let validator = ChecksumValidator::new(ChecksumAlgorithm::Sha256);
        assert!(validator.verify(&path, &digest).unwrap());
    }
}
