//! Durable pipeline state: records, the atomic store, and the run lock.
//!
//! The state store is the only mutable shared resource in the system. All
//! access is mediated by the advisory [`PipelineLock`] for exclusive
//! orchestration and by the generation-checked atomic commit for detecting
//! lock-bypassing races.

pub mod lock;
pub mod record;
pub mod store;

pub use lock::{LockError, PipelineLock};
pub use record::{PipelineState, StepRecord, StepStatus, SCHEMA_VERSION};
pub use store::{StateStore, StoreError};
