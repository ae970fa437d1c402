//! Test fixtures: a case directory plus shell stand-ins for the external tools.

use ak_core::config::models::AppConfig;
use ak_core::engine::{PipelineRun, RunHandle};
use ak_core::stage::{Pipeline, PipelineBuilder};
use ak_protocol::config_models::GlobalConfig;
use ak_protocol::ipc::Event;
use ak_protocol::pipeline_models::PipelineDefinition;
use ak_protocol::run_models::{ResumeMode, RunParams, RunReport};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Directory holding the tool scripts.
pub fn tools_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/common/tools")
}

pub fn tool(name: &str) -> String {
    tools_dir().join(name).to_string_lossy().into_owned()
}

/// Four-stage airway pipeline; `@TOOLS@` is replaced with [`tools_dir`].
const PIPELINE: &str = r#"
name: airway-cfd
stages:
  - name: segmentation
    progress: { base: 0, span: 25 }
    artifacts:
      patterns: ["segmentation/*.stl"]
    command:
      program: sh
      args: ["@TOOLS@/segment.sh", "{case_dir}"]
      success: either
      sentinel: Finished
      progress-regex: 'Progress (\d+)%'
  - name: reconstruction
    progress: { base: 25, span: 10 }
    depends-on: [segmentation]
    artifacts:
      dir: mesh
      patterns: ["airway.vtk"]
    command:
      program: sh
      args: ["@TOOLS@/reconstruct.sh", "{case_dir}"]
  - name: solver
    progress: { base: 35, span: 55 }
    depends-on: [reconstruction]
    artifacts:
      dir: "cfd/{flow_rate}LPM"
      patterns: ["inlet.txt"]
      completion: { min-step: 20 }
    command:
      program: sh
      args: ["@TOOLS@/solver.sh", "{flow_rate}"]
      progress-regex: '^Time = ([0-9.]+)'
      progress-max: 20
    monitor:
      log: log.solver
      interval-ms: 50
  - name: post-processing
    progress: { base: 90, span: 10 }
    depends-on: [solver]
    artifacts:
      dir: "report/{flow_rate}LPM"
      patterns: ["report.txt"]
    command:
      program: sh
      args: ["@TOOLS@/post.sh", "{flow_rate}"]
"#;

/// A case directory, the airway pipeline and a log of tool invocations.
///
/// Keep the value alive for the duration of the test.
pub struct Workbench {
    _dir: TempDir,
    pub case_dir: PathBuf,
    pub tool_log: PathBuf,
    pub definition: PipelineDefinition,
}

impl Workbench {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let case_dir = dir.path().join("patient-017");
        std::fs::create_dir_all(&case_dir).unwrap();
        let tool_log = dir.path().join("tools.log");

        let yaml = PIPELINE.replace("@TOOLS@", &tools_dir().to_string_lossy());
        let definition: PipelineDefinition = serde_yaml::from_str(&yaml).unwrap();

        let mut bench = Self {
            _dir: dir,
            case_dir,
            tool_log,
            definition,
        };
        let log = bench.tool_log.to_string_lossy().into_owned();
        for stage in ["segmentation", "reconstruction", "solver", "post-processing"] {
            bench.set_env(stage, "TOOL_LOG", &log);
        }
        bench
    }

    /// Set an environment variable for one stage's command.
    pub fn set_env(&mut self, stage: &str, key: &str, value: &str) {
        let stage = self
            .definition
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .unwrap();
        stage
            .command
            .as_mut()
            .unwrap()
            .env
            .insert(key.to_string(), value.to_string());
    }

    pub fn clear_env(&mut self, stage: &str, key: &str) {
        if let Some(command) = self
            .definition
            .stages
            .iter_mut()
            .find(|s| s.name == stage)
            .and_then(|s| s.command.as_mut())
        {
            command.env.remove(key);
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        PipelineBuilder::new(self.definition.clone()).build().unwrap()
    }

    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            global: fast_config(),
            pipelines: vec![self.definition.clone()],
        }
    }

    /// Start a run whose events go to `events_tx`.
    pub fn start(
        &self,
        params: RunParams,
        resume: ResumeMode,
        events_tx: mpsc::Sender<Event>,
    ) -> RunHandle {
        PipelineRun::new(self.pipeline(), &self.case_dir, params)
            .with_resume(resume)
            .with_config(fast_config())
            .start(events_tx)
    }

    /// Run to the end and return the final report with every event.
    pub async fn run(&self, params: RunParams, resume: ResumeMode) -> (RunReport, Vec<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let collector = collect_events(rx);
        let report = self.start(params, resume, tx).wait().await;
        (report, collector.await.unwrap())
    }

    /// Number of times `tool` was invoked (`segment`, `reconstruct`,
    /// `solver` or `post`).
    pub fn calls(&self, tool: &str) -> usize {
        std::fs::read_to_string(&self.tool_log)
            .unwrap_or_default()
            .lines()
            .filter(|line| line.split_whitespace().next() == Some(tool))
            .count()
    }

    pub fn solver_dir(&self, flow_rate: &str) -> PathBuf {
        self.case_dir.join(format!("cfd/{flow_rate}LPM"))
    }

    pub fn marker(&self, name: &str) -> PathBuf {
        self.case_dir.join(".airway/state").join(name)
    }
}

/// Short grace period and monitor interval so tests stay fast.
pub fn fast_config() -> GlobalConfig {
    GlobalConfig {
        kill_grace_ms: 500,
        monitor_interval_ms: 50,
        ..GlobalConfig::default()
    }
}

/// Drain a receiver on a background task until every sender is gone.
pub fn collect_events(mut rx: mpsc::Receiver<Event>) -> JoinHandle<Vec<Event>> {
    tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    })
}

/// Whether a process has exited. Zombies count as exited.
#[cfg(target_os = "linux")]
pub fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|state| state == "Z" || state == "X"),
    }
}

/// Poll `condition` every 20ms for at most `secs` seconds.
pub async fn eventually(secs: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    condition()
}
