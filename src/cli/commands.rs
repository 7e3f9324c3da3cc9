//! CLI command definitions for runforge.
//!
//! Four subcommands: `run` executes the pipeline (resuming verified work by
//! default), `plan` previews decisions without executing, `status` shows
//! persisted step records, and `reset` clears state for an identity.
//!
//! Exit codes distinguish the run outcomes an operator scripts against:
//! `0` success, `2` blocked by a failed step, `3` interrupted by signal,
//! `4` store corruption unrecoverable, `1` any other fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::error;

use crate::graph::{PipelineManifest, StepGraph};
use crate::pipeline::{
    latest_checkpoint, Orchestrator, OrchestratorConfig, PipelineError, ProcessExecutor, RunMode,
    RunReport,
};
use crate::recovery::RecoveryError;
use crate::shutdown::{RunPhase, ShutdownController};
use crate::state::{StateStore, StoreError};

/// Exit code for a run blocked by a failed step.
const EXIT_BLOCKED: u8 = 2;
/// Exit code for a run interrupted by a termination signal.
const EXIT_INTERRUPTED: u8 = 3;
/// Exit code for unrecoverable store corruption.
const EXIT_STORE_CORRUPT: u8 = 4;

/// Resumable pipeline orchestrator for multi-stage workflows.
#[derive(Parser)]
#[command(name = "runforge")]
#[command(about = "Run multi-stage pipelines with checkpointed, resumable state")]
#[command(version)]
#[command(
    long_about = "runforge converts a multi-stage workflow into a resumable, checkpointed process.\n\nSteps whose outputs verify against recorded checksums are skipped; everything else runs. Interrupting a run (Ctrl-C) stops at the next step boundary, and a second Ctrl-C aborts immediately at the last committed state.\n\nExample usage:\n  runforge run pipeline.yaml\n  runforge plan pipeline.yaml --json\n  runforge run pipeline.yaml --fresh"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline, resuming verified work.
    ///
    /// By default this reconciles persisted state first (rolling back
    /// half-finished or corrupted steps), then plans and executes. Use
    /// --no-reconcile to plan directly over existing state, or --fresh to
    /// clear state and run everything from scratch.
    Run(RunArgs),

    /// Show per-step decisions without executing anything.
    Plan(PlanArgs),

    /// Show persisted step records and latest training checkpoints.
    Status(StatusArgs),

    /// Clear persisted state for a pipeline identity.
    Reset(ResetArgs),
}

/// Arguments for `runforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Pipeline manifest (YAML).
    pub manifest: PathBuf,

    /// Clear persisted state first and run everything from scratch.
    #[arg(long)]
    pub fresh: bool,

    /// Skip the pre-run reconciliation pass.
    #[arg(long, conflicts_with = "fresh")]
    pub no_reconcile: bool,

    /// Directory holding pipeline state.
    #[arg(long, env = "RUNFORGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Per-step timeout in seconds.
    #[arg(long, env = "RUNFORGE_STEP_TIMEOUT_SECS")]
    pub step_timeout: Option<u64>,

    /// Output the run report as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `runforge plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Pipeline manifest (YAML).
    pub manifest: PathBuf,

    /// Directory holding pipeline state.
    #[arg(long, env = "RUNFORGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Output decisions as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `runforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Pipeline manifest (YAML).
    pub manifest: PathBuf,

    /// Directory holding pipeline state.
    #[arg(long, env = "RUNFORGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Output status as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `runforge reset`.
#[derive(Parser, Debug)]
pub struct ResetArgs {
    /// Pipeline manifest (YAML).
    pub manifest: PathBuf,

    /// Directory holding pipeline state.
    #[arg(long, env = "RUNFORGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Executes the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args).await,
        Commands::Plan(args) => plan_pipeline(args),
        Commands::Status(args) => show_status(args),
        Commands::Reset(args) => reset_state(args),
    }
}

/// Builds the orchestrator configuration from env plus CLI overrides.
fn build_config(
    state_dir: Option<PathBuf>,
    step_timeout: Option<u64>,
) -> anyhow::Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::from_env().context("reading configuration")?;
    if let Some(dir) = state_dir {
        config.state_dir = dir;
    }
    if let Some(secs) = step_timeout {
        config.step_timeout = Some(Duration::from_secs(secs));
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn load_graph(manifest: &PathBuf) -> anyhow::Result<StepGraph> {
    PipelineManifest::from_path(manifest)
        .with_context(|| format!("loading pipeline manifest {}", manifest.display()))
}

async fn run_pipeline(args: RunArgs) -> anyhow::Result<ExitCode> {
    let graph = load_graph(&args.manifest)?;
    let config = build_config(args.state_dir, args.step_timeout)?;

    let shutdown = ShutdownController::new();
    let signal_task = shutdown.install_signal_handler();

    let executor = Arc::new(ProcessExecutor::new(config.step_timeout));
    let orchestrator = Orchestrator::new(config, executor, shutdown.clone())?;

    let mode = if args.fresh {
        RunMode::Fresh
    } else if args.no_reconcile {
        RunMode::NoReconcile
    } else {
        RunMode::Resume
    };

    let result = orchestrator.run(&graph, mode).await;
    signal_task.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) if is_unrecoverable_corruption(&e) => {
            error!(error = %e, "Pipeline state is unrecoverably corrupt");
            eprintln!("error: {e}");
            eprintln!("hint: `runforge reset {}` clears the state", args.manifest.display());
            return Ok(ExitCode::from(EXIT_STORE_CORRUPT));
        }
        Err(e) => return Err(e.into()),
    };

    render_report(&report, args.json)?;

    Ok(match report.phase {
        RunPhase::Completed => ExitCode::SUCCESS,
        RunPhase::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
        _ => ExitCode::from(EXIT_BLOCKED),
    })
}

fn plan_pipeline(args: PlanArgs) -> anyhow::Result<ExitCode> {
    let graph = load_graph(&args.manifest)?;
    let config = build_config(args.state_dir, None)?;

    let shutdown = ShutdownController::new();
    let executor = Arc::new(ProcessExecutor::new(None));
    let orchestrator = Orchestrator::new(config, executor, shutdown)?;

    let decisions = match orchestrator.plan_preview(&graph) {
        Ok(decisions) => decisions,
        Err(e) if is_unrecoverable_corruption(&e) => {
            eprintln!("error: {e}");
            eprintln!("hint: `runforge run {}` repairs state before planning", args.manifest.display());
            return Ok(ExitCode::from(EXIT_STORE_CORRUPT));
        }
        Err(e) => return Err(e.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&decisions)?);
    } else {
        for decision in &decisions {
            println!("{decision}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// One line of `runforge status` output.
#[derive(Serialize)]
struct StepStatusLine {
    step: String,
    status: String,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_checkpoint: Option<PathBuf>,
}

fn show_status(args: StatusArgs) -> anyhow::Result<ExitCode> {
    let graph = load_graph(&args.manifest)?;
    let config = build_config(args.state_dir, None)?;
    let store = StateStore::new(&config.state_dir);

    let state = match store.load(graph.pipeline()) {
        Ok(state) => state,
        Err(e @ StoreError::Corrupt { .. }) => {
            eprintln!("error: {e}");
            eprintln!("hint: `runforge run {}` repairs state before planning", args.manifest.display());
            return Ok(ExitCode::from(EXIT_STORE_CORRUPT));
        }
        Err(e) => return Err(e.into()),
    };

    let mut lines = Vec::with_capacity(graph.len());
    for step in graph.topo_steps() {
        let record = state.step(&step.id);
        let checkpoint = match &step.checkpoint_dir {
            Some(dir) => latest_checkpoint(dir)?,
            None => None,
        };
        lines.push(StepStatusLine {
            step: step.id.clone(),
            status: state.status(&step.id).to_string(),
            attempts: record.map(|r| r.attempt_count).unwrap_or(0),
            finished_at: record
                .and_then(|r| r.finished_at)
                .map(|t| t.to_rfc3339()),
            output_checksum: record
                .and_then(|r| r.output_checksum.as_ref())
                .map(|d| d.to_string()),
            error_detail: record.and_then(|r| r.error_detail.clone()),
            latest_checkpoint: checkpoint,
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        println!(
            "pipeline: {} (generation {}, last consistent {})",
            state.pipeline, state.generation, state.last_consistent_generation
        );
        for line in &lines {
            print!("  {:<20} {:<10} attempts={}", line.step, line.status, line.attempts);
            if let Some(detail) = &line.error_detail {
                print!("  error: {detail}");
            }
            if let Some(checkpoint) = &line.latest_checkpoint {
                print!("  checkpoint: {}", checkpoint.display());
            }
            println!();
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn reset_state(args: ResetArgs) -> anyhow::Result<ExitCode> {
    let graph = load_graph(&args.manifest)?;
    let config = build_config(args.state_dir, None)?;
    let store = StateStore::new(&config.state_dir);

    store
        .clear(graph.pipeline())
        .with_context(|| format!("clearing state for pipeline '{}'", graph.pipeline()))?;
    println!("cleared state for pipeline '{}'", graph.pipeline());
    Ok(ExitCode::SUCCESS)
}

fn render_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {} ({} executed, {} skipped, {} failed, {} blocked, {} not reached) in {:.1}s",
        report.pipeline,
        report.phase,
        report.executed,
        report.skipped,
        report.failed,
        report.blocked,
        report.not_reached,
        report.duration_secs
    );
    for decision in &report.decisions {
        println!("  {decision}");
    }
    Ok(())
}

/// Returns whether an error means the store cannot be repaired.
fn is_unrecoverable_corruption(error: &PipelineError) -> bool {
    matches!(
        error,
        PipelineError::Recovery(RecoveryError::Unrecoverable { .. })
            | PipelineError::Store(StoreError::Corrupt { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::parse_from(["runforge", "run", "pipeline.yaml"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.manifest, PathBuf::from("pipeline.yaml"));
                assert!(!args.fresh);
                assert!(!args.no_reconcile);
                assert!(!args.json);
            }
            _ => panic!("Expected run subcommand"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_fresh_conflicts_with_no_reconcile() {
        let result = Cli::try_parse_from([
            "runforge",
            "run",
            "pipeline.yaml",
            "--fresh",
            "--no-reconcile",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_json_flag() {
        let cli = Cli::parse_from(["runforge", "plan", "pipeline.yaml", "--json"]);
        match cli.command {
            Commands::Plan(args) => assert!(args.json),
            _ => panic!("Expected plan subcommand"),
        }
    }
}
