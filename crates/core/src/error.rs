//! Error types for pipeline execution.
//!
//! A cancelled stage ends with [`PipelineError::Cancelled`] inside the
//! engine; the run itself is reported as `Cancelled`, never as `Failed`.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while building or executing a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required input of a stage is missing.
    #[error("Stage '{stage}' cannot start: {reason}")]
    StageSetup { stage: String, reason: String },

    /// The external command could not be started.
    #[error("Failed to launch '{program}' for stage '{stage}': {reason}")]
    SubprocessLaunch {
        stage: String,
        program: String,
        reason: String,
    },

    /// The process exited unsuccessfully and no success sentinel was seen.
    #[error("Stage '{stage}' failed: {detail}")]
    SubprocessFailure {
        stage: String,
        exit_code: Option<i32>,
        detail: String,
        stderr_tail: String,
    },

    /// The stage observed a cancellation request.
    #[error("Stage '{stage}' was cancelled")]
    Cancelled { stage: String },

    /// An artifact exists but fails the validity heuristic.
    #[error("Artifact of stage '{stage}' is incomplete or corrupt: {reason}")]
    ArtifactCorruption { stage: String, reason: String },

    /// An in-process stage task returned an error.
    #[error("Stage '{stage}' failed: {reason}")]
    Task { stage: String, reason: String },

    /// The pipeline definition is invalid.
    #[error("Invalid pipeline '{pipeline}': {reason}")]
    InvalidPipeline { pipeline: String, reason: String },

    /// The run parameters are unusable.
    #[error("Invalid run parameters: {reason}")]
    InvalidParams { reason: String },

    /// Another run is already active for the same case and parameters.
    #[error("A run is already active for {case_dir:?} ({params}): {run_id}")]
    RunAlreadyActive {
        case_dir: PathBuf,
        params: String,
        run_id: Uuid,
    },

    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    /// Cleanup is only offered for stages that did not complete.
    #[error("Refusing to clean up stage '{stage}': {reason}")]
    CleanupRefused { stage: String, reason: String },

    /// Filesystem error while probing or writing artifacts.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Name of the stage the error belongs to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::StageSetup { stage, .. }
            | PipelineError::SubprocessLaunch { stage, .. }
            | PipelineError::SubprocessFailure { stage, .. }
            | PipelineError::Cancelled { stage }
            | PipelineError::ArtifactCorruption { stage, .. }
            | PipelineError::Task { stage, .. }
            | PipelineError::CleanupRefused { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Captured stderr of the failing tool, empty when there is none.
    pub fn stderr_tail(&self) -> &str {
        match self {
            PipelineError::SubprocessFailure { stderr_tail, .. } => stderr_tail,
            _ => "",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Type alias for Result with PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;
