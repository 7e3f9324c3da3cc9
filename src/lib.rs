//! runforge: resumable pipeline orchestrator.
//!
//! This library turns a multi-stage workflow into a resumable, checkpointed
//! process: per-step state is persisted atomically, step outputs are
//! verified by content checksum, termination signals stop runs at safe
//! boundaries, and a rollback pass repairs whatever an unclean death left
//! behind before the next run plans.

// Core modules
pub mod checksum;
pub mod cli;
pub mod graph;
pub mod pipeline;
pub mod recovery;
pub mod shutdown;
pub mod state;

// Re-export commonly used error types
pub use checksum::ChecksumError;
pub use graph::GraphError;
pub use pipeline::{ConfigError, ExecError, PipelineError};
pub use recovery::RecoveryError;
pub use state::{LockError, StoreError};
