//! Pipeline definition models for `.airway/pipelines/*.yaml`.
//!
//! A pipeline definition is an ordered list of stages. Each stage declares
//! the share of global progress it owns, the artifacts that prove it has
//! completed, and either an external command or the name of an in-process
//! task registered by the embedding application.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

/// Highest result-step a solver must reach before its output counts as final.
pub const DEFAULT_MIN_STEP: f64 = 20.0;

/// How a subprocess signals success.
///
/// Several of the external tools only print a sentinel token instead of
/// returning a meaningful exit code, so the mode is chosen per stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, TS)]
#[serde(rename_all = "kebab-case")]
pub enum SuccessMode {
    /// Exit code 0 means success.
    #[default]
    ExitCode,

    /// The sentinel string appearing on stdout means success.
    Sentinel,

    /// Either of the above.
    Either,
}

/// The slice of global progress owned by a stage.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, TS)]
pub struct ProgressRange {
    /// Global percent at which the stage starts.
    pub base: f64,

    /// Width of the stage's slice, in global percent.
    pub span: f64,
}

impl ProgressRange {
    pub fn new(base: f64, span: f64) -> Self {
        Self { base, span }
    }

    /// Global percent at which the stage ends.
    pub fn end(&self) -> f64 {
        self.base + self.span
    }
}

/// Numeric completion proxy for solver-like stages.
///
/// The solver writes one directory per result step (`0`, `5`, `10.5`, ...).
/// Its output is only final once the highest step reaches `min_step`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct CompletionProxy {
    /// Directory holding the numbered step directories, relative to the
    /// stage's artifact root.
    #[serde(default = "default_steps_dir")]
    pub steps_dir: String,

    /// The highest step directory must be at least this value.
    #[serde(default = "default_min_step")]
    pub min_step: f64,

    /// Minimum number of numbered step directories, 0 disables the check.
    #[serde(default)]
    pub min_count: usize,
}

impl Default for CompletionProxy {
    fn default() -> Self {
        Self {
            steps_dir: default_steps_dir(),
            min_step: DEFAULT_MIN_STEP,
            min_count: 0,
        }
    }
}

fn default_steps_dir() -> String {
    ".".to_string()
}

fn default_min_step() -> f64 {
    DEFAULT_MIN_STEP
}

fn default_true() -> bool {
    true
}

/// Artifacts that evidence a stage's completion.
///
/// # Example
///
/// ```yaml
/// artifacts:
///   dir: "cfd/{flow_rate}LPM"
///   patterns: ["system/controlDict"]
///   completion:
///     steps-dir: "."
///     min-step: 20
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct ArtifactDefinition {
    /// Directory owned by the stage, relative to the case directory.
    ///
    /// May contain `{flow_rate}` so each parameter value gets its own
    /// directory. When absent, patterns resolve against the case directory.
    #[serde(default)]
    pub dir: Option<String>,

    /// Glob patterns that must each match at least one non-empty entry.
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Optional numeric completion proxy.
    #[serde(default)]
    pub completion: Option<CompletionProxy>,

    /// Require the completion marker written after a clean exit.
    #[serde(default = "default_true")]
    pub require_marker: bool,
}

impl Default for ArtifactDefinition {
    fn default() -> Self {
        Self {
            dir: None,
            patterns: Vec::new(),
            completion: None,
            require_marker: true,
        }
    }
}

impl ArtifactDefinition {
    /// Whether the artifact location depends on the run parameters.
    pub fn is_parameterized(&self) -> bool {
        self.dir
            .as_deref()
            .is_some_and(|dir| dir.contains("{flow_rate}"))
            || self.patterns.iter().any(|p| p.contains("{flow_rate}"))
    }
}

/// An external command wrapped by a stage.
///
/// `args`, `cwd` and `env` values may use the `{case_dir}`, `{stage_dir}`
/// and `{flow_rate}` placeholders.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct CommandDefinition {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, defaults to the stage's artifact root.
    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub success: SuccessMode,

    /// Literal token printed by the tool on success.
    #[serde(default)]
    pub sentinel: Option<String>,

    /// Regex with one capture group holding a progress value.
    #[serde(default)]
    pub progress_regex: Option<String>,

    /// Value of the capture group that corresponds to 100%.
    #[serde(default = "default_progress_max")]
    pub progress_max: f64,
}

fn default_progress_max() -> f64 {
    100.0
}

/// Background convergence monitor attached to a stage.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorDefinition {
    /// Solver log, relative to the stage's artifact root.
    pub log: String,

    /// Convergence output written on every tick, relative to the stage root.
    #[serde(default = "default_monitor_output")]
    pub output: String,

    /// Overrides the global poll interval.
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

fn default_monitor_output() -> String {
    "residuals.json".to_string()
}

/// One declared unit of a pipeline.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct StageDefinition {
    /// Unique stage name, e.g. `segmentation` or `solver`.
    pub name: String,

    pub progress: ProgressRange,

    /// Upstream stages whose artifacts must be valid before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub artifacts: ArtifactDefinition,

    /// External command. Stages without one are bound to an in-process task
    /// of the same name.
    #[serde(default)]
    pub command: Option<CommandDefinition>,

    #[serde(default)]
    pub monitor: Option<MonitorDefinition>,
}

/// Defines a full pipeline for one clinical case.
///
/// # Example
///
/// ```yaml
/// name: airway-cfd
/// stages:
///   - name: segmentation
///     progress: { base: 0, span: 30 }
///     artifacts:
///       patterns: ["segmentation/*.stl", "segmentation/preview.png"]
///     command:
///       program: "segment-airway"
///       args: ["--case", "{case_dir}"]
///       success: either
///       sentinel: "Finished"
///   - name: solver
///     progress: { base: 40, span: 50 }
///     depends-on: ["segmentation"]
///     artifacts:
///       dir: "cfd/{flow_rate}LPM"
///       completion: { min-step: 20 }
///     command:
///       program: "run-solver"
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineDefinition {
    /// Unique name identifying this pipeline.
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Stages in execution order.
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }
}
