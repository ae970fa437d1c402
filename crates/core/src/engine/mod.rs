//! Pipeline execution engine.
//!
//! A [`PipelineRun`] owns the ordered stages for one case and parameter set.
//! [`PipelineRun::start`] spawns a dedicated worker task that executes the
//! stages strictly in order, and returns a [`RunHandle`] used to cancel the
//! run, observe its status and wait for the final [`RunReport`].
//!
//! For each stage the worker:
//! 1. Skips it when its artifacts are already valid (unless a re-run was
//!    requested)
//! 2. Checks that upstream artifacts are valid
//! 3. Writes the partial-write marker and runs the executor
//! 4. Re-verifies the outputs and writes the completion marker

use crate::artifacts::{ArtifactResolver, Validity};
use crate::cancel::{CancellationController, TerminationPolicy};
use crate::error::{PipelineError, PipelineResult};
use crate::monitor::{MonitorHandle, ResidualMonitor};
use crate::paths::Placeholders;
use crate::progress::ProgressAggregator;
use crate::runner::{CommandSpec, SubprocessRunner};
use crate::stage::{Pipeline, Stage, StageContext, StageExecutor};
use crate::state::run::{
    advance_stage, cancel_run, complete_run, create_report, emit_terminal, fail_run,
    mark_cancelling, set_stage_status, start_run,
};
use ak_protocol::config_models::GlobalConfig;
use ak_protocol::ipc::Event;
use ak_protocol::pipeline_models::MonitorDefinition;
use ak_protocol::run_models::{
    ResumeMode, RunParams, RunReport, RunStatus, StageFailure, StageStatus,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// One execution of a pipeline for a case and parameter set.
pub struct PipelineRun {
    id: Uuid,
    pipeline: Arc<Pipeline>,
    case_dir: PathBuf,
    params: RunParams,
    resume: ResumeMode,
    config: GlobalConfig,
    controller: Arc<CancellationController>,
}

impl PipelineRun {
    /// Create a run with default settings.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - The validated stage list
    /// * `case_dir` - Directory of the clinical case
    /// * `params` - Parameter set, e.g. the flow rate
    pub fn new(pipeline: Pipeline, case_dir: impl Into<PathBuf>, params: RunParams) -> Self {
        let config = GlobalConfig::default();
        Self {
            id: Uuid::new_v4(),
            pipeline: Arc::new(pipeline),
            case_dir: case_dir.into(),
            params,
            resume: ResumeMode::default(),
            controller: Arc::new(controller_for(&config)),
            config,
        }
    }

    pub fn with_resume(mut self, resume: ResumeMode) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_config(mut self, config: GlobalConfig) -> Self {
        self.controller = Arc::new(controller_for(&config));
        self.config = config;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn case_dir(&self) -> &Path {
        &self.case_dir
    }

    pub fn params(&self) -> RunParams {
        self.params
    }

    /// Spawn the worker and return immediately.
    ///
    /// Events are sent through `events_tx` as execution progresses; the last
    /// event of a run is always `RunCompleted`, `RunFailed` or `RunCancelled`.
    pub fn start(self, events_tx: Sender<Event>) -> RunHandle {
        let report = create_report(
            self.id,
            self.pipeline.name.clone(),
            self.case_dir.clone(),
            self.params,
            self.pipeline.stages().iter().map(|s| s.name.as_str()),
        );
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        let shared = Arc::new(RunShared {
            report: Mutex::new(report.clone()),
            status: status_tx,
        });

        tracing::info!(
            run_id = %self.id,
            pipeline = %self.pipeline.name,
            case_dir = %self.case_dir.display(),
            params = %self.params.key(),
            "starting run"
        );

        let worker = Worker {
            runner: SubprocessRunner::new(
                Arc::clone(&self.controller),
                self.config.stderr_tail_lines,
            ),
            progress: ProgressAggregator::new(self.id, events_tx.clone()),
            pipeline: Arc::clone(&self.pipeline),
            case_dir: self.case_dir.clone(),
            params: self.params,
            resume: self.resume,
            config: self.config,
            controller: Arc::clone(&self.controller),
            shared: Arc::clone(&shared),
            events_tx,
            report,
        };
        let task = tokio::spawn(worker.run());

        RunHandle {
            id: self.id,
            pipeline: self.pipeline,
            case_dir: self.case_dir,
            params: self.params,
            controller: self.controller,
            shared,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

fn controller_for(config: &GlobalConfig) -> CancellationController {
    CancellationController::new(TerminationPolicy::with_grace(Duration::from_millis(
        config.kill_grace_ms,
    )))
}

struct RunShared {
    report: Mutex<RunReport>,
    status: watch::Sender<RunStatus>,
}

impl RunShared {
    fn report(&self) -> MutexGuard<'_, RunReport> {
        self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Caller-side handle of a started run.
///
/// Cloning the handle is cheap; every clone controls the same run.
#[derive(Clone)]
pub struct RunHandle {
    id: Uuid,
    pipeline: Arc<Pipeline>,
    case_dir: PathBuf,
    params: RunParams,
    controller: Arc<CancellationController>,
    shared: Arc<RunShared>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline.name
    }

    pub fn case_dir(&self) -> &Path {
        &self.case_dir
    }

    pub fn params(&self) -> RunParams {
        self.params
    }

    /// Request cancellation and return immediately.
    ///
    /// The status switches to `Cancelling` at once; `RunCancelled` is
    /// emitted after every subprocess and monitor has been torn down.
    /// Returns `true` only for the call that requested cancellation.
    pub fn cancel(&self) -> bool {
        let first = self.controller.request_cancel();
        let changed = self.shared.status.send_if_modified(|status| {
            if matches!(status, RunStatus::Pending | RunStatus::Running) {
                *status = RunStatus::Cancelling;
                true
            } else {
                false
            }
        });
        if changed {
            self.shared.report().status = RunStatus::Cancelling;
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.controller.is_cancelled()
    }

    pub fn status(&self) -> RunStatus {
        *self.shared.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
        self.shared.status.subscribe()
    }

    /// Snapshot of the run as last published by the worker.
    pub fn report(&self) -> RunReport {
        self.shared.report().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Wait for the worker to finish and return the final report.
    pub async fn wait(&self) -> RunReport {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::error!(run_id = %self.id, error = %e, "run worker panicked");
                    let mut report = self.shared.report();
                    report.status = RunStatus::Failed;
                    report.finished_at = Some(chrono::Utc::now());
                    drop(report);
                    self.shared.status.send_replace(RunStatus::Failed);
                }
            }
            None => {
                let mut status = self.subscribe_status();
                let _ = status.wait_for(|s| s.is_terminal()).await;
            }
        }
        self.report()
    }

    /// Delete the output of a stage that did not complete in this run.
    ///
    /// Only allowed once the run is Cancelled or Failed. Artifacts that
    /// still pass the validity heuristic are never deleted. Returns whether
    /// anything was removed, so repeated calls are harmless.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::CleanupRefused`] when the run is still active
    /// or completed, the stage is unknown, or its output is valid.
    pub fn cleanup_partial(&self, stage: &str) -> PipelineResult<bool> {
        let refuse = |reason: &str| PipelineError::CleanupRefused {
            stage: stage.to_string(),
            reason: reason.to_string(),
        };

        match self.status() {
            RunStatus::Cancelled | RunStatus::Failed => {}
            RunStatus::Completed => return Err(refuse("the run completed")),
            _ => return Err(refuse("the run is still active")),
        }
        let definition = self
            .pipeline
            .stage(stage)
            .ok_or_else(|| refuse("no such stage in this pipeline"))?;

        let resolution = definition.resolve(&self.case_dir, &self.params)?;
        if resolution.skip {
            return Err(refuse("its artifacts are complete"));
        }

        ArtifactResolver::cleanup(stage, &definition.artifacts, &self.case_dir, &self.params)
    }
}

/// State owned by the worker task.
struct Worker {
    pipeline: Arc<Pipeline>,
    case_dir: PathBuf,
    params: RunParams,
    resume: ResumeMode,
    config: GlobalConfig,
    controller: Arc<CancellationController>,
    runner: SubprocessRunner,
    progress: ProgressAggregator,
    shared: Arc<RunShared>,
    events_tx: Sender<Event>,
    report: RunReport,
}

impl Worker {
    async fn run(mut self) {
        start_run(&mut self.report, &self.events_tx).await;
        self.publish();

        let pipeline = Arc::clone(&self.pipeline);
        for (index, stage) in pipeline.stages().iter().enumerate() {
            advance_stage(&mut self.report, index);

            if self.controller.is_cancelled() {
                self.finish_cancelled(index, stage).await;
                return;
            }

            match self.run_stage(index, stage).await {
                Ok(skipped) => {
                    set_stage_status(
                        &mut self.report,
                        &self.events_tx,
                        index,
                        StageStatus::Completed,
                        skipped,
                    )
                    .await;
                    self.publish();
                }
                Err(e) if e.is_cancelled() || self.controller.is_cancelled() => {
                    if !e.is_cancelled() {
                        tracing::debug!(stage = %stage.name, error = %e, "error after cancellation request");
                    }
                    self.finish_cancelled(index, stage).await;
                    return;
                }
                Err(e) => {
                    self.finish_failed(index, stage, e).await;
                    return;
                }
            }
        }

        let last = pipeline
            .stages()
            .last()
            .map(|s| s.name.as_str())
            .unwrap_or_default();
        self.progress.finish(last, "Pipeline completed").await;
        complete_run(&mut self.report);
        self.settle().await;
        tracing::info!(run_id = %self.report.id, "run completed");
    }

    /// Execute one stage. Returns whether it was skipped.
    async fn run_stage(&mut self, index: usize, stage: &Stage) -> PipelineResult<bool> {
        let name = stage.name.as_str();
        let markers = ArtifactResolver::markers(name, &stage.artifacts, &self.case_dir, &self.params);

        if self.resume.forces(name) {
            // Old output must not satisfy the post-run check.
            let cleared =
                ArtifactResolver::cleanup(name, &stage.artifacts, &self.case_dir, &self.params)?;
            tracing::info!(stage = name, cleared, "re-run requested, previous output removed");
        } else {
            let resolution = stage.resolve(&self.case_dir, &self.params)?;
            if resolution.skip {
                tracing::info!(stage = name, "valid artifacts found, skipping");
                self.progress
                    .report(name, stage.range, 100.0, format!("Reusing existing {name} output"), None)
                    .await;
                return Ok(true);
            }
            match &resolution.record.validity {
                Validity::PartialWrite => {
                    tracing::warn!(stage = name, "interrupted output found, re-executing stage");
                }
                validity => tracing::debug!(stage = name, ?validity, "stage needs to run"),
            }
        }

        self.check_dependencies(stage)?;

        if self.controller.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: name.to_string(),
            });
        }

        let stage_dir = stage.stage_dir(&self.case_dir, &self.params)?;
        std::fs::create_dir_all(&stage_dir).map_err(|e| PipelineError::io(&stage_dir, e))?;
        markers
            .begin()
            .map_err(|e| PipelineError::io(markers.partial_path(), e))?;

        set_stage_status(&mut self.report, &self.events_tx, index, StageStatus::Running, false).await;
        self.publish();
        tracing::info!(stage = name, stage_dir = %stage_dir.display(), "stage started");
        self.progress
            .report(name, stage.range, 0.0, format!("Starting {name}"), None)
            .await;

        let monitor = match &stage.monitor {
            Some(definition) => Some(self.start_monitor(stage, definition, &stage_dir)?),
            None => None,
        };

        let result = self.execute(stage, &stage_dir).await;

        if let Some(monitor) = monitor {
            monitor.stop(&self.controller).await;
        }
        result?;

        let record =
            ArtifactResolver::inspect(name, &stage.artifacts, &self.case_dir, &self.params, false)?;
        if !record.validity.is_complete() {
            return Err(PipelineError::ArtifactCorruption {
                stage: name.to_string(),
                reason: format!("stage exited cleanly but its output is not valid: {:?}", record.validity),
            });
        }
        markers
            .finish()
            .map_err(|e| PipelineError::io(markers.complete_path(), e))?;

        tracing::info!(stage = name, "stage completed");
        self.progress
            .report(name, stage.range, 100.0, format!("{name} completed"), None)
            .await;
        Ok(false)
    }

    async fn execute(&mut self, stage: &Stage, stage_dir: &Path) -> PipelineResult<()> {
        match &stage.executor {
            StageExecutor::Command(definition) => {
                let placeholders =
                    Placeholders::new(&self.case_dir, &self.params).with_stage_dir(stage_dir);
                let command =
                    CommandSpec::from_definition(&stage.name, definition, &placeholders, stage_dir)?;
                let result = self
                    .runner
                    .run(&stage.name, stage.range, &command, &mut self.progress)
                    .await?;
                result.into_stage_result(&stage.name).map(|_| ())
            }
            StageExecutor::Task(task) => {
                let mut ctx = StageContext::new(
                    self.report.id,
                    &stage.name,
                    &self.case_dir,
                    stage_dir.to_path_buf(),
                    self.params,
                    stage.range,
                    &self.controller,
                    &mut self.progress,
                );
                task.run(&mut ctx).await
            }
        }
    }

    /// Upstream artifacts must exist and be valid before a stage runs.
    fn check_dependencies(&self, stage: &Stage) -> PipelineResult<()> {
        for dependency in &stage.depends_on {
            let upstream = self.pipeline.stage(dependency).ok_or_else(|| {
                PipelineError::InvalidPipeline {
                    pipeline: self.pipeline.name.clone(),
                    reason: format!("unknown dependency '{dependency}'"),
                }
            })?;
            let record = ArtifactResolver::inspect(
                dependency,
                &upstream.artifacts,
                &self.case_dir,
                &self.params,
                true,
            )?;

            match &record.validity {
                Validity::Complete => {}
                Validity::Missing if !record.has_output() => {
                    return Err(PipelineError::StageSetup {
                        stage: stage.name.clone(),
                        reason: format!(
                            "output of '{dependency}' is missing: {}",
                            record.missing.join(", ")
                        ),
                    });
                }
                validity => {
                    return Err(PipelineError::ArtifactCorruption {
                        stage: dependency.clone(),
                        reason: match validity {
                            Validity::Incomplete { reason } => reason.clone(),
                            Validity::PartialWrite => "an interrupted write was detected".to_string(),
                            _ => format!("missing {}", record.missing.join(", ")),
                        },
                    });
                }
            }
        }
        Ok(())
    }

    fn start_monitor(
        &self,
        stage: &Stage,
        definition: &MonitorDefinition,
        stage_dir: &Path,
    ) -> PipelineResult<MonitorHandle> {
        let placeholders = Placeholders::new(&self.case_dir, &self.params).with_stage_dir(stage_dir);
        let log = stage_dir.join(placeholders.expand_for(&stage.name, &definition.log)?);
        let output = stage_dir.join(placeholders.expand_for(&stage.name, &definition.output)?);
        let interval = Duration::from_millis(
            definition
                .interval_ms
                .unwrap_or(self.config.monitor_interval_ms),
        );

        let mut monitor = ResidualMonitor::new(&stage.name, log, output, interval);
        if let Some(proxy) = &stage.artifacts.completion {
            monitor = monitor.with_completion(stage_dir.join(&proxy.steps_dir), proxy.clone());
        }
        Ok(monitor.spawn(&self.controller))
    }

    async fn finish_cancelled(&mut self, index: usize, stage: &Stage) {
        mark_cancelling(&mut self.report, &self.events_tx).await;
        self.publish();
        set_stage_status(&mut self.report, &self.events_tx, index, StageStatus::Cancelled, false).await;
        cancel_run(&mut self.report);
        self.settle().await;
        tracing::info!(run_id = %self.report.id, stage = %stage.name, "run cancelled");
    }

    async fn finish_failed(&mut self, index: usize, stage: &Stage, error: PipelineError) {
        tracing::error!(run_id = %self.report.id, stage = %stage.name, error = %error, "stage failed");
        set_stage_status(&mut self.report, &self.events_tx, index, StageStatus::Failed, false).await;
        let failure = StageFailure {
            stage: stage.name.clone(),
            detail: error.to_string(),
            stderr_tail: error.stderr_tail().to_string(),
        };
        fail_run(&mut self.report, failure);
        self.settle().await;
    }

    /// Publish a terminal state, then emit its events.
    ///
    /// Handles observe the terminal status before the terminal event is sent.
    async fn settle(&mut self) {
        self.publish();
        emit_terminal(&self.report, &self.events_tx).await;
    }

    /// Make the worker's view visible to handles.
    fn publish(&mut self) {
        self.report.progress = self.progress.percent();
        self.report.last_message = self.progress.last_message().to_string();

        let status = self.report.status;
        self.shared.status.send_if_modified(|current| {
            let cancelling = *current == RunStatus::Cancelling && !status.is_terminal();
            if cancelling || *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        let current = *self.shared.status.borrow();
        let mut snapshot = self.shared.report();
        *snapshot = self.report.clone();
        snapshot.status = current;
    }
}
