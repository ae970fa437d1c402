//! Stage model and pipeline assembly.
//!
//! A [`Stage`] is a declarative unit: a name, its slice of global progress,
//! the artifacts that prove it finished, and an executor. Executors either
//! wrap an external command or call an in-process [`StageTask`] registered
//! by the embedding application (for example a bridge to the 3D boundary
//! editor).

use crate::artifacts::{ArtifactResolver, Resolution};
use crate::cancel::CancellationController;
use crate::error::{PipelineError, PipelineResult};
use crate::progress::ProgressAggregator;
use ak_protocol::pipeline_models::{
    ArtifactDefinition, CommandDefinition, MonitorDefinition, PipelineDefinition, ProgressRange,
};
use ak_protocol::run_models::RunParams;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Everything an in-process task may touch while it runs.
pub struct StageContext<'a> {
    pub run_id: Uuid,
    pub stage: &'a str,
    pub case_dir: &'a Path,

    /// Artifact root of the stage, created before the task starts.
    pub stage_dir: PathBuf,

    pub params: RunParams,
    range: ProgressRange,
    controller: &'a CancellationController,
    progress: &'a mut ProgressAggregator,
}

impl<'a> StageContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: Uuid,
        stage: &'a str,
        case_dir: &'a Path,
        stage_dir: PathBuf,
        params: RunParams,
        range: ProgressRange,
        controller: &'a CancellationController,
        progress: &'a mut ProgressAggregator,
    ) -> Self {
        Self {
            run_id,
            stage,
            case_dir,
            stage_dir,
            params,
            range,
            controller,
            progress,
        }
    }

    /// Report stage-local progress in percent.
    pub async fn report(&mut self, local_percent: f64, message: impl Into<String>) {
        self.progress
            .report(self.stage, self.range, local_percent, message, None)
            .await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.controller.is_cancelled()
    }

    /// Cancellation point for cooperative tasks.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> PipelineResult<()> {
        if self.controller.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: self.stage.to_string(),
            });
        }
        Ok(())
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.controller.cancelled().await
    }
}

/// A stage implemented inside the host application.
///
/// Tasks run on the orchestrator's worker and must call
/// [`StageContext::checkpoint`] between units of work.
#[async_trait]
pub trait StageTask: Send + Sync {
    async fn run(&self, ctx: &mut StageContext<'_>) -> PipelineResult<()>;
}

/// How a stage does its work.
#[derive(Clone)]
pub enum StageExecutor {
    Command(CommandDefinition),
    Task(Arc<dyn StageTask>),
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageExecutor::Command(command) => f.debug_tuple("Command").field(command).finish(),
            StageExecutor::Task(_) => f.write_str("Task(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub range: ProgressRange,
    pub depends_on: Vec<String>,
    pub artifacts: ArtifactDefinition,
    pub executor: StageExecutor,
    pub monitor: Option<MonitorDefinition>,
}

impl Stage {
    pub fn command(name: impl Into<String>, range: ProgressRange, command: CommandDefinition) -> Self {
        Self::new(name, range, StageExecutor::Command(command))
    }

    pub fn task(name: impl Into<String>, range: ProgressRange, task: Arc<dyn StageTask>) -> Self {
        Self::new(name, range, StageExecutor::Task(task))
    }

    fn new(name: impl Into<String>, range: ProgressRange, executor: StageExecutor) -> Self {
        Self {
            name: name.into(),
            range,
            depends_on: Vec::new(),
            artifacts: ArtifactDefinition::default(),
            executor,
            monitor: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactDefinition) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorDefinition) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Skip predicate: whether valid output already exists.
    pub fn resolve(&self, case_dir: &Path, params: &RunParams) -> PipelineResult<Resolution> {
        ArtifactResolver::resolve(&self.name, &self.artifacts, case_dir, params)
    }

    pub fn stage_dir(&self, case_dir: &Path, params: &RunParams) -> PipelineResult<PathBuf> {
        ArtifactResolver::stage_root(&self.name, &self.artifacts, case_dir, params)
    }
}

/// An ordered, validated list of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate and assemble a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPipeline`] when stage names repeat, a
    /// dependency does not name an earlier stage, or progress ranges leave
    /// 0..=100, go backward or overlap.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> PipelineResult<Self> {
        let name = name.into();
        let invalid = |reason: String| PipelineError::InvalidPipeline {
            pipeline: name.clone(),
            reason,
        };

        if stages.is_empty() {
            return Err(invalid("pipeline has no stages".to_string()));
        }

        let mut seen = HashSet::new();
        let mut previous_end = 0.0;
        for stage in &stages {
            for dependency in &stage.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(invalid(format!(
                        "stage '{}' depends on '{dependency}', which is not an earlier stage",
                        stage.name
                    )));
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.name)));
            }

            let range = stage.range;
            if !(range.base.is_finite() && range.span.is_finite())
                || range.base < 0.0
                || range.span < 0.0
                || range.end() > 100.0
            {
                return Err(invalid(format!(
                    "stage '{}' progress range {}..{} is outside 0..100",
                    stage.name,
                    range.base,
                    range.end()
                )));
            }
            if range.base < previous_end {
                return Err(invalid(format!(
                    "stage '{}' starts at {} but the previous stage ends at {previous_end}",
                    stage.name, range.base
                )));
            }
            previous_end = range.end();
        }

        Ok(Self { name, stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Builds a [`Pipeline`] from a definition plus registered in-process tasks.
///
/// # Example
///
/// ```no_run
/// # use ak_core::stage::{PipelineBuilder, StageTask};
/// # use ak_protocol::pipeline_models::PipelineDefinition;
/// # use std::sync::Arc;
/// # fn build(definition: PipelineDefinition, editor: Arc<dyn StageTask>) {
/// let pipeline = PipelineBuilder::new(definition)
///     .register_task("boundary-editing", editor)
///     .build()
///     .unwrap();
/// # }
/// ```
pub struct PipelineBuilder {
    definition: PipelineDefinition,
    tasks: HashMap<String, Arc<dyn StageTask>>,
}

impl PipelineBuilder {
    pub fn new(definition: PipelineDefinition) -> Self {
        Self {
            definition,
            tasks: HashMap::new(),
        }
    }

    /// Bind a command-less stage to an in-process task.
    pub fn register_task(mut self, stage: impl Into<String>, task: Arc<dyn StageTask>) -> Self {
        self.tasks.insert(stage.into(), task);
        self
    }

    pub fn register_tasks(mut self, tasks: &HashMap<String, Arc<dyn StageTask>>) -> Self {
        self.tasks
            .extend(tasks.iter().map(|(name, task)| (name.clone(), Arc::clone(task))));
        self
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPipeline`] when a command-less stage
    /// has no registered task or the stage list is invalid.
    pub fn build(self) -> PipelineResult<Pipeline> {
        let PipelineDefinition { name, stages, .. } = self.definition;

        let stages = stages
            .into_iter()
            .map(|definition| {
                let executor = match definition.command {
                    Some(command) => StageExecutor::Command(command),
                    None => match self.tasks.get(&definition.name) {
                        Some(task) => StageExecutor::Task(Arc::clone(task)),
                        None => {
                            return Err(PipelineError::InvalidPipeline {
                                pipeline: name.clone(),
                                reason: format!(
                                    "stage '{}' has no command and no registered task",
                                    definition.name
                                ),
                            })
                        }
                    },
                };
                Ok(Stage {
                    name: definition.name,
                    range: definition.progress,
                    depends_on: definition.depends_on,
                    artifacts: definition.artifacts,
                    executor,
                    monitor: definition.monitor,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        Pipeline::new(name, stages)
    }
}
