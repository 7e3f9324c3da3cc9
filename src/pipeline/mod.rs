//! Pipeline orchestration: configuration, execution, and the run loop.
//!
//! # Architecture
//!
//! - **Orchestrator**: plans over graph + state and drives step execution
//!   with atomic per-boundary commits
//! - **Executor**: the seam to external executable units (`sh -c` commands
//!   by default)
//! - **Config**: state directory, checksum algorithm, retry bounds, and
//!   step limits
//!
//! Resuming after any interruption is the normal run path: load state,
//! plan, execute whatever is not verifiably done.

pub mod config;
pub mod executor;
pub mod orchestrator;

pub use config::{ConfigError, OrchestratorConfig};
pub use executor::{latest_checkpoint, ExecError, ProcessExecutor, StepExecutor};
pub use orchestrator::{Orchestrator, PipelineError, RunMode, RunReport};
