//! Persisted per-step and per-pipeline state records.
//!
//! A [`PipelineState`] is the durable memory of one pipeline identity: a map
//! from step id to [`StepRecord`], a schema version, and a generation counter
//! bumped on every atomic write. Records enforce the core invariants at the
//! type level where possible and via [`PipelineState::validate`] otherwise.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checksum::ArtifactDigest;

/// Current schema version of the persisted state record.
pub const SCHEMA_VERSION: u32 = 1;

/// Status of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet run, or downgraded after its output was invalidated.
    Pending,
    /// Currently executing. A persisted `Running` record after process
    /// death means the previous run died mid-step.
    Running,
    /// Finished successfully with a recorded output checksum.
    Completed,
    /// Finished unsuccessfully with a recorded error detail.
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted record for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Current status.
    pub status: StepStatus,
    /// When the most recent attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the most recent attempt reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Combined digest of the declared outputs; present iff `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_checksum: Option<ArtifactDigest>,
    /// Failure cause; present only when `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Number of execution attempts across all runs.
    #[serde(default)]
    pub attempt_count: u32,
}

impl Default for StepRecord {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            output_checksum: None,
            error_detail: None,
            attempt_count: 0,
        }
    }
}

impl StepRecord {
    /// Transitions to `Running` for a new attempt.
    pub fn mark_running(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.output_checksum = None;
        self.error_detail = None;
        self.attempt_count += 1;
    }

    /// Transitions to `Completed` with the verified output digest.
    pub fn mark_completed(&mut self, digest: ArtifactDigest) {
        self.status = StepStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.output_checksum = Some(digest);
        self.error_detail = None;
    }

    /// Transitions to `Failed` with the underlying cause.
    pub fn mark_failed(&mut self, detail: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.output_checksum = None;
        self.error_detail = Some(detail.into());
    }

    /// Downgrades to `Pending`, discarding the recorded outcome.
    ///
    /// Attempt history is kept; checksum and error details are cleared so
    /// the record satisfies the `Pending` invariants again.
    pub fn downgrade(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.finished_at = None;
        self.output_checksum = None;
        self.error_detail = None;
    }

    /// Checks the per-record structural invariants.
    pub fn validate(&self) -> Result<(), String> {
        let completed = self.status == StepStatus::Completed;
        if self.output_checksum.is_some() != completed {
            return Err(format!(
                "output_checksum must be present iff status is completed (status: {})",
                self.status
            ));
        }
        if self.error_detail.is_some() && self.status != StepStatus::Failed {
            return Err(format!(
                "error_detail present on non-failed record (status: {})",
                self.status
            ));
        }
        if let (Some(started), Some(finished)) = (self.started_at, self.finished_at) {
            if finished < started {
                return Err(format!(
                    "finished_at {finished} precedes started_at {started}"
                ));
            }
        }
        Ok(())
    }
}

/// Durable state for one pipeline identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Version of this record's schema.
    pub schema_version: u32,
    /// Pipeline identity this state belongs to.
    pub pipeline: String,
    /// Monotonic counter bumped by exactly 1 on every atomic write.
    pub generation: u64,
    /// Last generation verified to have all referenced artifacts intact.
    pub last_consistent_generation: u64,
    /// Per-step records, ordered for deterministic serialization.
    pub steps: BTreeMap<String, StepRecord>,
    /// When this identity's state was first created.
    pub created_at: DateTime<Utc>,
    /// When this state was last written.
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Creates the empty state for a pipeline identity (generation 0).
    pub fn new(pipeline: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            pipeline: pipeline.into(),
            generation: 0,
            last_consistent_generation: 0,
            steps: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the record for a step, if any attempt was ever made.
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    /// Returns the status of a step, `Pending` if never recorded.
    pub fn status(&self, id: &str) -> StepStatus {
        self.steps
            .get(id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    /// Returns a mutable record for a step, creating a pending one.
    pub fn step_mut(&mut self, id: &str) -> &mut StepRecord {
        self.steps.entry(id.to_string()).or_default()
    }

    /// Checks structural validity of the whole record.
    ///
    /// Used by the store to distinguish a corrupt persisted record from a
    /// genuinely absent one.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            ));
        }
        if self.pipeline.is_empty() {
            return Err("pipeline identity is empty".to_string());
        }
        if self.last_consistent_generation > self.generation {
            return Err(format!(
                "last_consistent_generation {} exceeds generation {}",
                self.last_consistent_generation, self.generation
            ));
        }
        for (id, record) in &self.steps {
            record
                .validate()
                .map_err(|reason| format!("step '{id}': {reason}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_display() {
        assert_eq!(format!("{}", StepStatus::Pending), "pending");
        assert_eq!(format!("{}", StepStatus::Running), "running");
        assert_eq!(format!("{}", StepStatus::Completed), "completed");
        assert_eq!(format!("{}", StepStatus::Failed), "failed");
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = StepRecord::default();
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.attempt_count, 0);
        record.validate().expect("Pending record should be valid");

        record.mark_running();
        assert_eq!(record.status, StepStatus::Running);
        assert_eq!(record.attempt_count, 1);
        assert!(record.started_at.is_some());
        record.validate().expect("Running record should be valid");

        record.mark_completed(ArtifactDigest::new("sha256:abcd"));
        assert_eq!(record.status, StepStatus::Completed);
        assert!(record.output_checksum.is_some());
        assert!(record.finished_at.unwrap() >= record.started_at.unwrap());
        record.validate().expect("Completed record should be valid");
    }

    #[test]
    fn test_record_failure_keeps_attempt_history() {
        let mut record = StepRecord::default();
        record.mark_running();
        record.mark_failed("exit status 1");
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error_detail.as_deref(), Some("exit status 1"));
        assert!(record.output_checksum.is_none());
        record.validate().expect("Failed record should be valid");

        record.mark_running();
        assert_eq!(record.attempt_count, 2);
        assert!(record.error_detail.is_none());
    }

    #[test]
    fn test_downgrade_restores_pending_invariants() {
        let mut record = StepRecord::default();
        record.mark_running();
        record.mark_completed(ArtifactDigest::new("sha256:abcd"));

        record.downgrade();
        assert_eq!(record.status, StepStatus::Pending);
        assert!(record.output_checksum.is_none());
        assert_eq!(record.attempt_count, 1);
        record.validate().expect("Downgraded record should be valid");
    }

    #[test]
    fn test_checksum_iff_completed_invariant() {
        let mut record = StepRecord::default();
        record.output_checksum = Some(ArtifactDigest::new("sha256:abcd"));
        assert!(record.validate().is_err());

        record.status = StepStatus::Completed;
        assert!(record.validate().is_ok());

        record.output_checksum = None;
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_finished_before_started_is_invalid() {
        let mut record = StepRecord::default();
        record.status = StepStatus::Failed;
        record.error_detail = Some("boom".to_string());
        record.started_at = Some(Utc::now());
        record.finished_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_state_validate_schema_and_generations() {
        let mut state = PipelineState::new("demo");
        state.validate().expect("Fresh state should be valid");

        state.last_consistent_generation = 3;
        assert!(state.validate().is_err());

        state.last_consistent_generation = 0;
        state.schema_version = 99;
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = PipelineState::new("demo");
        state.step_mut("download").mark_running();
        state
            .step_mut("download")
            .mark_completed(ArtifactDigest::new("sha256:1234"));

        let json = serde_json::to_string_pretty(&state).unwrap();
        let loaded: PipelineState = serde_json::from_str(&json).unwrap();
        loaded.validate().expect("Roundtripped state should be valid");
        assert_eq!(loaded.status("download"), StepStatus::Completed);
        assert_eq!(loaded.pipeline, "demo");
    }

    #[test]
    fn test_status_defaults_to_pending_for_unknown_step() {
        let state = PipelineState::new("demo");
        assert_eq!(state.status("never-ran"), StepStatus::Pending);
    }
}
