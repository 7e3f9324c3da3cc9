//! Durable, atomic persistence for pipeline state.
//!
//! One JSON document per pipeline identity, written via temp-file +
//! atomic rename so a reader never observes a partial record. Every commit
//! bumps the state's generation by exactly 1 and is rejected with a
//! [`StoreError::Conflict`] when the on-disk generation moved underneath it
//! (two orchestrators racing on the same identity). A record that exists but
//! fails parsing or structural validation loads as [`StoreError::Corrupt`] —
//! distinct from genuine absence, which loads as an empty generation-0 state.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use super::record::PipelineState;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read or write the state directory.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize the state record.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The persisted record exists but is not structurally valid.
    #[error("Corrupt state record at {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// An optimistic-concurrency write race: the on-disk generation does
    /// not match the generation the write was derived from.
    #[error("Write conflict: state was derived from generation {expected}, store is at generation {actual}")]
    Conflict { expected: u64, actual: u64 },
}

/// What the canonical state file currently holds.
enum DiskState {
    Missing,
    Corrupt,
    Committed(u64),
}

/// File-backed state store, one record per pipeline identity.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at the given state directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the canonical record path for a pipeline identity.
    pub fn state_path(&self, pipeline_id: &str) -> PathBuf {
        self.dir.join(format!("{pipeline_id}.json"))
    }

    /// Returns the backup record path for a pipeline identity.
    pub fn backup_path(&self, pipeline_id: &str) -> PathBuf {
        self.dir.join(format!("{pipeline_id}.backup.json"))
    }

    /// Returns whether a persisted record exists for this identity.
    pub fn exists(&self, pipeline_id: &str) -> bool {
        self.state_path(pipeline_id).exists()
    }

    /// Loads the state for a pipeline identity.
    ///
    /// A missing record yields an empty generation-0 state; a record that
    /// exists but fails parsing or validation yields `StoreError::Corrupt`.
    pub fn load(&self, pipeline_id: &str) -> Result<PipelineState, StoreError> {
        let path = self.state_path(pipeline_id);
        if !path.exists() {
            debug!(pipeline = pipeline_id, "No persisted state, starting empty");
            return Ok(PipelineState::new(pipeline_id));
        }
        Self::read_record(&path)
    }

    /// Loads the backup record, if one exists.
    ///
    /// Used by the rollback manager when the primary record is corrupt.
    pub fn load_backup(&self, pipeline_id: &str) -> Result<Option<PipelineState>, StoreError> {
        let path = self.backup_path(pipeline_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    /// Atomically persists a new state, bumping its generation by 1.
    ///
    /// The write fails with `StoreError::Conflict` when the state's
    /// generation does not match the on-disk generation it claims to
    /// replace. The previous committed record is copied aside as a backup
    /// before the rename, so corruption of the primary never loses the last
    /// good snapshot.
    pub fn commit(&self, mut state: PipelineState) -> Result<PipelineState, StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.state_path(&state.pipeline);

        match self.disk_state(&path) {
            DiskState::Committed(disk_generation) => {
                if state.generation != disk_generation {
                    return Err(StoreError::Conflict {
                        expected: state.generation,
                        actual: disk_generation,
                    });
                }
                fs::copy(&path, self.backup_path(&state.pipeline))?;
            }
            DiskState::Missing => {
                if state.generation != 0 {
                    return Err(StoreError::Conflict {
                        expected: state.generation,
                        actual: 0,
                    });
                }
            }
            DiskState::Corrupt => {
                // Recovery path: the rollback manager is replacing a record
                // that no longer has a trustworthy generation.
                warn!(
                    pipeline = %state.pipeline,
                    "Replacing corrupt state record"
                );
            }
        }

        state.generation += 1;
        state.updated_at = Utc::now();

        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        debug!(
            pipeline = %state.pipeline,
            generation = state.generation,
            "State committed"
        );
        Ok(state)
    }

    /// Removes the persisted record and its backup.
    ///
    /// Clearing state is an explicit user action, distinct from a failed
    /// run; it is never done implicitly.
    pub fn clear(&self, pipeline_id: &str) -> Result<(), StoreError> {
        for path in [self.state_path(pipeline_id), self.backup_path(pipeline_id)] {
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Reads and validates a record file.
    fn read_record(path: &Path) -> Result<PipelineState, StoreError> {
        let content = fs::read_to_string(path)?;
        let state: PipelineState =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        state.validate().map_err(|reason| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(state)
    }

    /// Classifies the canonical file without surfacing parse errors.
    fn disk_state(&self, path: &Path) -> DiskState {
        if !path.exists() {
            return DiskState::Missing;
        }
        match Self::read_record(path) {
            Ok(state) => DiskState::Committed(state.generation),
            Err(_) => DiskState::Corrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ArtifactDigest;
    use crate::state::record::StepStatus;
    use std::fs;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::new(temp_dir.path());
        (temp_dir, store)
    }

    #[test]
    fn test_load_missing_returns_empty_state() {
        let (_guard, store) = store();
        let state = store.load("demo").expect("Load should succeed");
        assert_eq!(state.generation, 0);
        assert!(state.steps.is_empty());
        assert_eq!(state.pipeline, "demo");
    }

    #[test]
    fn test_commit_bumps_generation_by_one() {
        let (_guard, store) = store();
        let state = store.load("demo").unwrap();

        let state = store.commit(state).expect("First commit should succeed");
        assert_eq!(state.generation, 1);

        let state = store.commit(state).expect("Second commit should succeed");
        assert_eq!(state.generation, 2);

        let loaded = store.load("demo").unwrap();
        assert_eq!(loaded.generation, 2);
    }

    #[test]
    fn test_commit_roundtrips_step_records() {
        let (_guard, store) = store();
        let mut state = store.load("demo").unwrap();
        state.step_mut("download").mark_running();
        state
            .step_mut("download")
            .mark_completed(ArtifactDigest::new("sha256:1234"));

        store.commit(state).unwrap();

        let loaded = store.load("demo").unwrap();
        assert_eq!(loaded.status("download"), StepStatus::Completed);
        assert_eq!(
            loaded.step("download").unwrap().output_checksum,
            Some(ArtifactDigest::new("sha256:1234"))
        );
    }

    #[test]
    fn test_stale_generation_gets_conflict() {
        let (_guard, store) = store();
        let base = store.load("demo").unwrap();

        // Two writers derive their state from the same generation.
        let first = base.clone();
        let second = base;

        store.commit(first).expect("First writer should win");
        let err = store.commit(second).expect_err("Second writer must lose");
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_corrupt_record_is_distinct_from_missing() {
        let (_guard, store) = store();
        fs::create_dir_all(store.state_path("demo").parent().unwrap()).unwrap();
        fs::write(store.state_path("demo"), b"{ not json").unwrap();

        let err = store.load("demo").expect_err("Corrupt record must not load");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_structurally_invalid_record_is_corrupt() {
        let (_guard, store) = store();
        let mut state = store.load("demo").unwrap();
        // Violate the checksum-iff-completed invariant directly on disk.
        state.step_mut("bad").output_checksum = Some(ArtifactDigest::new("sha256:00"));
        let json = serde_json::to_string_pretty(&state).unwrap();
        fs::create_dir_all(store.state_path("demo").parent().unwrap()).unwrap();
        fs::write(store.state_path("demo"), json).unwrap();

        let err = store.load("demo").expect_err("Invalid record must not load");
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_backup_survives_primary_corruption() {
        let (_guard, store) = store();
        let mut state = store.load("demo").unwrap();
        state.step_mut("download").mark_running();
        let state = store.commit(state).unwrap();
        store.commit(state).unwrap();

        // Simulate a torn write of the primary record.
        fs::write(store.state_path("demo"), b"garbage").unwrap();

        assert!(matches!(
            store.load("demo"),
            Err(StoreError::Corrupt { .. })
        ));
        let backup = store
            .load_backup("demo")
            .expect("Backup should load")
            .expect("Backup should exist");
        assert_eq!(backup.generation, 1);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (guard, store) = store();
        let state = store.load("demo").unwrap();
        store.commit(state).unwrap();

        let stray: Vec<_> = fs::read_dir(guard.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(".json"))
            .collect();
        assert!(stray.is_empty(), "Unexpected stray files: {stray:?}");
    }

    #[test]
    fn test_clear_removes_record_and_backup() {
        let (_guard, store) = store();
        let state = store.load("demo").unwrap();
        let state = store.commit(state).unwrap();
        store.commit(state).unwrap();
        assert!(store.exists("demo"));

        store.clear("demo").expect("Clear should succeed");
        assert!(!store.exists("demo"));
        assert!(!store.backup_path("demo").exists());

        // Cleared state starts fresh at generation 0.
        let fresh = store.load("demo").unwrap();
        assert_eq!(fresh.generation, 0);
    }
}
