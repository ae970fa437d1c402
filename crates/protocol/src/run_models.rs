//! Runtime run state models.
//!
//! This module defines the structures for tracking the state of a pipeline
//! run for one clinical case and parameter set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use ts_rs::TS;
use uuid::Uuid;

/// Lifecycle status of a pipeline run.
///
/// Normal execution: Pending -> Running -> Completed
///
/// - Cancelling: cancellation requested, the current stage is unwinding
/// - Cancelled: the run stopped because of a cancellation request
/// - Failed: a stage returned an error
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run has been created but its worker has not started.
    Pending,

    /// Stages are executing.
    Running,

    /// Cancellation was requested and teardown is in progress.
    Cancelling,

    /// Teardown finished after a cancellation request.
    Cancelled,

    /// A stage failed and the run stopped.
    Failed,

    /// Every stage completed or was skipped.
    Completed,
}

impl RunStatus {
    /// Whether the run has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled | RunStatus::Failed | RunStatus::Completed
        )
    }
}

/// Status of a single stage within a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Parameters of a run.
///
/// Parameterized stages store their artifacts under a directory derived from
/// these values, so runs with different values never share output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default, TS)]
#[serde(rename_all = "kebab-case")]
pub struct RunParams {
    /// Inspiratory flow rate in litres per minute.
    #[serde(default)]
    pub flow_rate: Option<f64>,
}

impl RunParams {
    pub fn with_flow_rate(flow_rate: f64) -> Self {
        Self {
            flow_rate: Some(flow_rate),
        }
    }

    /// Why these parameters cannot drive a run, if they cannot.
    ///
    /// A flow rate must be a finite number above zero.
    pub fn invalid_reason(&self) -> Option<String> {
        match self.flow_rate {
            Some(rate) if !rate.is_finite() || rate <= 0.0 => {
                Some(format!("flow rate must be a positive number, got {rate}"))
            }
            _ => None,
        }
    }

    /// Text substituted for `{flow_rate}` in paths and arguments.
    ///
    /// `10.0` renders as `10` and `12.5` as `12.5`.
    pub fn flow_rate_label(&self) -> Option<String> {
        self.flow_rate.map(|rate| format!("{rate}"))
    }

    /// Stable key used to tell parameter sets apart.
    pub fn key(&self) -> String {
        match self.flow_rate_label() {
            Some(label) => format!("flow={label}"),
            None => "default".to_string(),
        }
    }
}

/// Whether existing artifacts may be reused.
///
/// Completed artifacts are only ever recomputed on an explicit request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default, TS)]
#[serde(tag = "mode", content = "stages", rename_all = "kebab-case")]
pub enum ResumeMode {
    /// Skip every stage whose artifacts are already complete.
    #[default]
    ReuseExisting,

    /// Recompute the named stages, reuse everything else.
    Rerun(Vec<String>),

    /// Recompute every stage.
    RerunAll,
}

impl ResumeMode {
    /// Whether the stage must execute even when its artifacts are complete.
    pub fn forces(&self, stage: &str) -> bool {
        match self {
            ResumeMode::ReuseExisting => false,
            ResumeMode::Rerun(stages) => stages.iter().any(|s| s == stage),
            ResumeMode::RerunAll => true,
        }
    }
}

/// A progress update delivered to the caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ProgressEvent {
    /// Stage that produced the update.
    pub stage: String,

    /// Global progress in percent, 0 to 100.
    pub percent: f64,

    /// Human readable message.
    pub message: String,

    /// Raw output line of the external tool, if the update came from one.
    pub raw_line: Option<String>,
}

/// Record of one stage within a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct StageOutcome {
    pub name: String,
    pub status: StageStatus,

    /// The stage completed by reusing existing artifacts.
    pub skipped: bool,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageOutcome {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            skipped: false,
            started_at: None,
            finished_at: None,
        }
    }
}

/// The error surfaced when a run fails.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
pub struct StageFailure {
    /// Name of the failing stage.
    pub stage: String,

    /// Underlying error.
    pub detail: String,

    /// Last lines of the tool's stderr, empty for in-process stages.
    pub stderr_tail: String,
}

/// Runtime state of a single pipeline run.
///
/// A new report is created each time processing is started for a case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct RunReport {
    /// Unique identifier of this run.
    #[ts(type = "string")]
    pub id: Uuid,

    pub pipeline_name: String,

    /// Directory of the clinical case.
    pub case_dir: PathBuf,

    pub params: RunParams,

    pub status: RunStatus,

    /// Zero-based index of the stage currently executing, or the stage the
    /// run stopped at.
    pub current_stage: usize,

    /// Global progress in percent.
    pub progress: f64,

    /// Last progress message, kept for display after the run ends.
    pub last_message: String,

    /// One entry per stage, in pipeline order.
    pub stages: Vec<StageOutcome>,

    pub failure: Option<StageFailure>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.name == name)
    }
}
