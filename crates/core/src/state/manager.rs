//! Run manager coordinating every pipeline run of a process.
//!
//! The RunManager keeps a registry of runs, enforces that at most one run is
//! active per case and parameter set, and dispatches [`Op`]s received from a
//! front end.

use crate::config::models::AppConfig;
use crate::engine::{PipelineRun, RunHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::stage::{PipelineBuilder, StageTask};
use ak_protocol::ipc::{Event, Op};
use ak_protocol::run_models::{ResumeMode, RunParams, RunReport};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Manages all pipeline runs.
///
/// The RunManager provides a centralized interface for:
/// - Starting runs from loaded pipeline definitions
/// - Cancelling runs and cleaning up after them
/// - Querying run state
pub struct RunManager {
    /// Registry of runs, indexed by their UUID.
    runs: Arc<Mutex<HashMap<Uuid, RunHandle>>>,

    config: AppConfig,

    /// In-process tasks for stages without a command.
    tasks: HashMap<String, Arc<dyn StageTask>>,

    /// Channel for sending events to the front end.
    events_tx: mpsc::Sender<Event>,
}

impl RunManager {
    /// Create a new RunManager.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded global settings and pipeline definitions
    /// * `events_tx` - Channel for sending events to the front end
    pub fn new(config: AppConfig, events_tx: mpsc::Sender<Event>) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            config,
            tasks: HashMap::new(),
            events_tx,
        }
    }

    /// Bind a command-less stage to an in-process task.
    pub fn register_task(&mut self, stage: impl Into<String>, task: Arc<dyn StageTask>) {
        self.tasks.insert(stage.into(), task);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Start processing a case in the background.
    ///
    /// A finished run for the same case and parameters is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RunAlreadyActive`] when a run for the same
    /// case and parameters has not reached a terminal state,
    /// [`PipelineError::InvalidParams`] for a flow rate that is not a
    /// positive number, and [`PipelineError::InvalidPipeline`] when the
    /// pipeline is unknown or invalid.
    pub async fn start_run(
        &self,
        case_dir: &Path,
        pipeline_name: &str,
        params: RunParams,
        resume: ResumeMode,
    ) -> PipelineResult<RunHandle> {
        if let Some(reason) = params.invalid_reason() {
            return Err(PipelineError::InvalidParams { reason });
        }
        let definition = self.config.pipeline(pipeline_name).ok_or_else(|| {
            PipelineError::InvalidPipeline {
                pipeline: pipeline_name.to_string(),
                reason: "no pipeline with this name is configured".to_string(),
            }
        })?;
        let pipeline = PipelineBuilder::new(definition.clone())
            .register_tasks(&self.tasks)
            .build()?;

        let case_dir = normalize(case_dir);
        let key = params.key();

        let mut runs = self.runs.lock().await;
        let same_key: Vec<Uuid> = runs
            .values()
            .filter(|run| run.case_dir() == case_dir && run.params().key() == key)
            .map(RunHandle::id)
            .collect();
        for id in same_key {
            let finished = runs.get(&id).is_some_and(RunHandle::is_finished);
            if !finished {
                return Err(PipelineError::RunAlreadyActive {
                    case_dir,
                    params: key,
                    run_id: id,
                });
            }
            runs.remove(&id);
        }

        let handle = PipelineRun::new(pipeline, case_dir, params)
            .with_resume(resume)
            .with_config(self.config.global.clone())
            .start(self.events_tx.clone());
        runs.insert(handle.id(), handle.clone());
        Ok(handle)
    }

    async fn handle(&self, run_id: Uuid) -> PipelineResult<RunHandle> {
        self.runs
            .lock()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    /// Request cancellation of a run. Returns immediately.
    pub async fn cancel_run(&self, run_id: Uuid) -> PipelineResult<bool> {
        Ok(self.handle(run_id).await?.cancel())
    }

    /// Delete the output of a stage that did not complete and report it.
    pub async fn cleanup_partial(&self, run_id: Uuid, stage: &str) -> PipelineResult<bool> {
        let removed = self.handle(run_id).await?.cleanup_partial(stage)?;
        let _ = self
            .events_tx
            .send(Event::CleanupFinished {
                run_id,
                stage: stage.to_string(),
                removed,
            })
            .await;
        Ok(removed)
    }

    /// Forget a run, cancelling it first if it is still active.
    pub async fn discard_run(&self, run_id: Uuid) -> PipelineResult<RunReport> {
        let handle = self
            .runs
            .lock()
            .await
            .remove(&run_id)
            .ok_or(PipelineError::RunNotFound(run_id))?;
        if !handle.is_finished() {
            handle.cancel();
        }
        Ok(handle.wait().await)
    }

    /// Get the current state of a run.
    pub async fn get_run(&self, run_id: Uuid) -> Option<RunReport> {
        self.runs.lock().await.get(&run_id).map(RunHandle::report)
    }

    /// Get every known run.
    pub async fn get_all_runs(&self) -> Vec<RunReport> {
        self.runs
            .lock()
            .await
            .values()
            .map(RunHandle::report)
            .collect()
    }

    /// Id of the unfinished run for a case and parameter set, if any.
    pub async fn active_run(&self, case_dir: &Path, params: &RunParams) -> Option<Uuid> {
        let case_dir = normalize(case_dir);
        let key = params.key();
        self.runs
            .lock()
            .await
            .values()
            .find(|run| run.case_dir() == case_dir && run.params().key() == key && !run.is_finished())
            .map(RunHandle::id)
    }

    pub async fn run_count(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Cancel every active run and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<RunHandle> = self.runs.lock().await.values().cloned().collect();
        for handle in &handles {
            handle.cancel();
        }
        for handle in handles {
            handle.wait().await;
        }
    }

    /// Apply one operation.
    ///
    /// Returns `false` once a shutdown was processed.
    pub async fn handle_op(&self, op: Op) -> PipelineResult<bool> {
        match op {
            Op::StartRun {
                case_dir,
                pipeline_name,
                params,
                resume,
            } => {
                self.start_run(&case_dir, &pipeline_name, params, resume)
                    .await?;
            }
            Op::CancelRun { run_id } => {
                self.cancel_run(run_id).await?;
            }
            Op::CleanupPartial { run_id, stage } => {
                self.cleanup_partial(run_id, &stage).await?;
            }
            Op::DiscardRun { run_id } => {
                self.discard_run(run_id).await?;
            }
            Op::Shutdown => {
                self.shutdown().await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Serve operations until shutdown or until the channel closes.
    ///
    /// Rejected operations are logged and do not stop the loop.
    pub async fn serve(&self, mut ops_rx: mpsc::Receiver<Op>) {
        while let Some(op) = ops_rx.recv().await {
            match self.handle_op(op).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => tracing::warn!(error = %e, "operation rejected"),
            }
        }
        self.shutdown().await;
    }
}

/// Canonical form of a case path when it exists, the path itself otherwise.
fn normalize(case_dir: &Path) -> PathBuf {
    std::fs::canonicalize(case_dir).unwrap_or_else(|_| case_dir.to_path_buf())
}
