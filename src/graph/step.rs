//! Declarative step specifications and the pipeline DAG.
//!
//! A pipeline is described by a YAML manifest: a pipeline identity plus a
//! list of steps, each naming its dependencies, declared output artifacts,
//! and the shell command that produces them. The graph is validated up
//! front (unique ids, known dependencies, acyclic) and exposes a
//! deterministic topological order with declaration-order tie-breaking —
//! planning must be reproducible for resumability to be trustworthy.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::{ArtifactDigest, ChecksumAlgorithm, ChecksumError, ChecksumValidator};

/// Errors that can occur while loading or validating a step graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two steps share an identifier.
    #[error("Duplicate step id '{0}'")]
    DuplicateStep(String),

    /// A step names a dependency that does not exist in the graph.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The dependency edges contain a cycle.
    #[error("Circular dependency detected involving steps: {0}")]
    CircularDependency(String),

    /// The manifest declares no steps.
    #[error("Pipeline '{0}' declares no steps")]
    EmptyGraph(String),

    /// Failed to read the manifest file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the manifest YAML.
    #[error("Manifest parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A declared output artifact of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Path of the artifact, relative to the orchestrator's working
    /// directory unless absolute.
    pub path: PathBuf,
    /// Checksum algorithm override for this artifact; the orchestrator's
    /// configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<ChecksumAlgorithm>,
}

impl ArtifactSpec {
    /// Creates a descriptor using the configured default algorithm.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            algorithm: None,
        }
    }
}

/// A named unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Identifier, unique within the pipeline.
    pub id: String,
    /// Identifiers of steps that must be `Completed` first.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Declared output artifacts, checksummed on completion.
    #[serde(default)]
    pub outputs: Vec<ArtifactSpec>,
    /// Shell command that produces the outputs (run via `sh -c`).
    pub command: String,
    /// Extra environment variables for the command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory for the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Directory where a training step writes self-described checkpoints.
    /// The orchestrator only enumerates it, never interprets contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

impl StepSpec {
    /// Creates a minimal step with no dependencies or outputs.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deps: Vec::new(),
            outputs: Vec::new(),
            command: command.into(),
            env: BTreeMap::new(),
            workdir: None,
            checkpoint_dir: None,
        }
    }

    /// Adds a dependency edge.
    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    /// Adds a declared output artifact.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(ArtifactSpec::new(path));
        self
    }

    /// Returns the declared output paths in declaration order.
    pub fn output_paths(&self) -> Vec<&Path> {
        self.outputs.iter().map(|a| a.path.as_path()).collect()
    }

    /// Computes the combined digest over the declared outputs.
    ///
    /// Each artifact is fingerprinted with its own algorithm (or the
    /// default), then the per-artifact digests are combined under the
    /// default algorithm. A step with no declared outputs digests the
    /// empty set, which is stable.
    pub fn output_digest(
        &self,
        default: ChecksumAlgorithm,
    ) -> Result<ArtifactDigest, ChecksumError> {
        if self.outputs.len() == 1 {
            let artifact = &self.outputs[0];
            let validator = ChecksumValidator::new(artifact.algorithm.unwrap_or(default));
            return validator.fingerprint(&artifact.path);
        }
        let mut digests = Vec::with_capacity(self.outputs.len());
        for artifact in &self.outputs {
            let validator = ChecksumValidator::new(artifact.algorithm.unwrap_or(default));
            digests.push(validator.fingerprint(&artifact.path)?);
        }
        Ok(ChecksumValidator::new(default).combine(&digests))
    }
}

/// The YAML manifest describing one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineManifest {
    /// Pipeline identity: the stable key under which state persists.
    pub pipeline: String,
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl PipelineManifest {
    /// Loads and validates a manifest from a YAML file.
    pub fn from_path(path: &Path) -> Result<StepGraph, GraphError> {
        let content = std::fs::read_to_string(path)?;
        let manifest: PipelineManifest = serde_yaml::from_str(&content)?;
        StepGraph::new(manifest.pipeline, manifest.steps)
    }
}

/// A validated pipeline DAG with a precomputed deterministic order.
#[derive(Debug, Clone)]
pub struct StepGraph {
    pipeline: String,
    steps: Vec<StepSpec>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl StepGraph {
    /// Builds and validates a graph from declared steps.
    ///
    /// # Errors
    ///
    /// Returns `GraphError` for duplicate ids, unknown dependencies,
    /// cycles, or an empty step list.
    pub fn new(pipeline: impl Into<String>, steps: Vec<StepSpec>) -> Result<Self, GraphError> {
        let pipeline = pipeline.into();
        if steps.is_empty() {
            return Err(GraphError::EmptyGraph(pipeline));
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
        }
        for step in &steps {
            for dep in &step.deps {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = topological_order(&steps, &index)?;
        Ok(Self {
            pipeline,
            steps,
            index,
            order,
        })
    }

    /// Returns the pipeline identity.
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns whether the graph has no steps (never true post-validation).
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    /// Returns steps in deterministic topological order.
    ///
    /// Ties among independently-runnable steps are broken by declaration
    /// order, so repeated planning over unchanged inputs is reproducible.
    pub fn topo_steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.order.iter().map(|&i| &self.steps[i])
    }

    /// Returns all transitive dependents of a step.
    ///
    /// Used to propagate invalidation forward: a dependent is never left
    /// `Completed` on top of an invalidated dependency.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut dependents = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            for step in &self.steps {
                if step.deps.iter().any(|d| d == current) && dependents.insert(step.id.clone()) {
                    queue.push_back(&step.id);
                }
            }
        }
        dependents
    }
}

/// Kahn's algorithm with a declaration-index priority queue.
fn topological_order(
    steps: &[StepSpec],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, GraphError> {
    let mut in_degree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.deps {
            let d = index[dep];
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    // BTreeSet keeps the ready set sorted by declaration index.
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &deg)| deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &dep in &dependents[next] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                ready.insert(dep);
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg > 0)
            .map(|(i, _)| steps[i].id.as_str())
            .collect();
        return Err(GraphError::CircularDependency(stuck.join(", ")));
    }
    Ok(order)
}
