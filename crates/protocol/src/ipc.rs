//! Communication protocol between a front end and the core.
//!
//! The protocol follows an Operation/Event pattern:
//! - `Op`: Commands sent from the front end to the core
//! - `Event`: Status and progress updates sent from the core
//!
//! Communication is asynchronous and channel-based. The core only guarantees
//! ordered emission from its worker task; marshalling events onto a UI
//! thread is the front end's job.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use ts_rs::TS;
use uuid::Uuid;

use crate::run_models::{ProgressEvent, ResumeMode, RunParams, RunStatus, StageStatus};

/// Operations sent from a front end to the core.
///
/// Uses tagged enum serialization for TypeScript compatibility:
/// ```json
/// {
///   "type": "startRun",
///   "payload": {
///     "case_dir": "/cases/patient-017",
///     "pipeline_name": "airway-cfd",
///     "params": { "flow-rate": 15.0 },
///     "resume": { "mode": "reuse-existing" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Op {
    /// Start processing a case.
    StartRun {
        case_dir: PathBuf,
        pipeline_name: String,
        params: RunParams,
        #[serde(default)]
        resume: ResumeMode,
    },

    /// Request cancellation. Returns immediately.
    CancelRun {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// Delete the output of a stage that did not complete.
    CleanupPartial {
        #[ts(type = "string")]
        run_id: Uuid,
        stage: String,
    },

    /// Forget a finished run.
    DiscardRun {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// Cancel every active run and stop serving operations.
    Shutdown,
}

/// Events sent from the core to a front end.
///
/// ```json
/// {
///   "type": "progress",
///   "payload": {
///     "run_id": "uuid-here",
///     "event": { "stage": "solver", "percent": 62.5, "message": "...", "raw_line": null }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A run has been started.
    RunStarted {
        #[ts(type = "string")]
        run_id: Uuid,
        pipeline_name: String,
        case_dir: PathBuf,
        params: RunParams,
    },

    /// The run-level status changed.
    RunStatusUpdate {
        #[ts(type = "string")]
        run_id: Uuid,
        status: RunStatus,
        stage_index: usize,
    },

    /// A stage changed status.
    StageStatusUpdate {
        #[ts(type = "string")]
        run_id: Uuid,
        stage: String,
        status: StageStatus,
        skipped: bool,
    },

    /// Global progress moved or a stage produced output.
    Progress {
        #[ts(type = "string")]
        run_id: Uuid,
        event: ProgressEvent,
    },

    /// Every stage completed.
    RunCompleted {
        #[ts(type = "string")]
        run_id: Uuid,
    },

    /// A stage failed and the run stopped.
    RunFailed {
        #[ts(type = "string")]
        run_id: Uuid,
        stage: String,
        error: String,
        stderr_tail: String,
    },

    /// Teardown after a cancellation request has finished.
    RunCancelled {
        #[ts(type = "string")]
        run_id: Uuid,
        stage: Option<String>,
    },

    /// Output of a stage was removed by a cleanup request.
    CleanupFinished {
        #[ts(type = "string")]
        run_id: Uuid,
        stage: String,
        removed: bool,
    },
}

impl Event {
    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::RunCompleted { .. } | Event::RunFailed { .. } | Event::RunCancelled { .. }
        )
    }
}
