//! Background convergence monitor for solver stages.
//!
//! While the solver runs, a [`ResidualMonitor`] polls its log on a timer,
//! parses the residual history and rewrites the convergence output through a
//! [`ConvergenceWriter`]. The monitor ends when its loop token is stopped,
//! when the run is cancelled, or when the final result step appears on disk.
//! A failing tick is logged and retried; the monitor never fails a run.

use crate::artifacts::steps::scan_steps;
use crate::cancel::CancellationController;
use ak_protocol::pipeline_models::CompletionProxy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One residual sample.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ResidualPoint {
    pub time: f64,
    pub initial: f64,
}

/// Residual history per solved field.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Residuals {
    /// Solver time steps seen in the log, in order.
    pub times: Vec<f64>,

    /// Initial residual of the first solve of each field per time step.
    pub fields: BTreeMap<String, Vec<ResidualPoint>>,
}

impl Residuals {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn last_time(&self) -> Option<f64> {
        self.times.last().copied()
    }
}

fn time_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Time = ([0-9.eE+-]+)\s*$").ok())
        .as_ref()
}

fn solve_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Solving for (\w+), Initial residual = ([0-9.eE+-]+)").ok())
        .as_ref()
}

/// Parse a solver log into residual series.
///
/// Lines before the first `Time =` line are ignored, and only the first
/// solve of each field per time step is kept.
pub fn parse_residuals(log: &str) -> Residuals {
    let mut residuals = Residuals::default();
    let (Some(time_line), Some(solve_line)) = (time_line(), solve_line()) else {
        return residuals;
    };
    let mut current: Option<f64> = None;
    let mut solved: Vec<String> = Vec::new();

    for line in log.lines() {
        let line = line.trim();
        if let Some(time) = time_line
            .captures(line)
            .and_then(|c| c.get(1)?.as_str().parse::<f64>().ok())
        {
            current = Some(time);
            residuals.times.push(time);
            solved.clear();
            continue;
        }

        let Some(time) = current else { continue };
        let Some(captures) = solve_line.captures(line) else {
            continue;
        };
        let (Some(field), Some(value)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        let Ok(initial) = value.as_str().parse::<f64>() else {
            continue;
        };
        let field = field.as_str();
        if solved.iter().any(|f| f == field) {
            continue;
        }
        solved.push(field.to_string());
        residuals
            .fields
            .entry(field.to_string())
            .or_default()
            .push(ResidualPoint { time, initial });
    }

    residuals
}

/// Destination of convergence data.
pub trait ConvergenceWriter: Send + Sync {
    fn write(&self, path: &Path, residuals: &Residuals) -> io::Result<()>;
}

/// Writes residuals as pretty JSON, replacing the file atomically.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConvergenceWriter;

impl ConvergenceWriter for JsonConvergenceWriter {
    fn write(&self, path: &Path, residuals: &Residuals) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(residuals).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }
}

/// Why a monitor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The loop token was stopped or the run was cancelled.
    Stopped,

    /// The final result step appeared.
    Converged,
}

/// Watches one solver log.
pub struct ResidualMonitor {
    stage: String,
    log: PathBuf,
    output: PathBuf,
    completion: Option<(PathBuf, CompletionProxy)>,
    interval: Duration,
    writer: Arc<dyn ConvergenceWriter>,
}

impl ResidualMonitor {
    pub fn new(stage: impl Into<String>, log: PathBuf, output: PathBuf, interval: Duration) -> Self {
        Self {
            stage: stage.into(),
            log,
            output,
            completion: None,
            interval,
            writer: Arc::new(JsonConvergenceWriter),
        }
    }

    /// Stop once the step directories under `steps_dir` satisfy `proxy`.
    pub fn with_completion(mut self, steps_dir: PathBuf, proxy: CompletionProxy) -> Self {
        self.completion = Some((steps_dir, proxy));
        self
    }

    pub fn with_writer(mut self, writer: Arc<dyn ConvergenceWriter>) -> Self {
        self.writer = writer;
        self
    }

    /// Parse the log once and rewrite the output.
    ///
    /// Returns `Ok(None)` when the log is missing or empty.
    pub fn tick(&self) -> io::Result<Option<Residuals>> {
        let log = match std::fs::read_to_string(&self.log) {
            Ok(log) => log,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if log.trim().is_empty() {
            return Ok(None);
        }

        let residuals = parse_residuals(&log);
        self.writer.write(&self.output, &residuals)?;
        Ok(Some(residuals))
    }

    /// Tick and check for the final step off the async runtime.
    async fn poll(self: &Arc<Self>) -> (io::Result<Option<Residuals>>, bool) {
        let monitor = Arc::clone(self);
        match tokio::task::spawn_blocking(move || (monitor.tick(), monitor.converged())).await {
            Ok(polled) => polled,
            Err(e) => (Err(io::Error::other(e)), false),
        }
    }

    fn converged(&self) -> bool {
        self.completion.as_ref().is_some_and(|(dir, proxy)| {
            scan_steps(dir).is_ok_and(|scan| scan.reaches(proxy.min_step))
        })
    }

    /// Start polling on its own task under a loop token of `controller`.
    pub fn spawn(self, controller: &CancellationController) -> MonitorHandle {
        let name = format!("monitor:{}", self.stage);
        let token = controller.register_loop(&name);
        let task = tokio::spawn(Arc::new(self).run(token.clone()));
        MonitorHandle { name, token, task }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) -> MonitorExit {
        tracing::debug!(stage = %self.stage, log = %self.log.display(), "residual monitor started");

        let exit = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break MonitorExit::Stopped,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let (ticked, converged) = self.poll().await;
            match ticked {
                Ok(Some(residuals)) => {
                    tracing::trace!(stage = %self.stage, time = ?residuals.last_time(), "residuals updated");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(stage = %self.stage, error = %e, "residual monitor tick failed");
                }
            }

            if converged {
                break MonitorExit::Converged;
            }
        };

        // Final pass so the output reflects the whole log.
        if let (Err(e), _) = self.poll().await {
            tracing::warn!(stage = %self.stage, error = %e, "final residual update failed");
        }
        tracing::debug!(stage = %self.stage, ?exit, "residual monitor finished");
        exit
    }
}

/// Handle of a running monitor.
pub struct MonitorHandle {
    name: String,
    token: CancellationToken,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the loop and wait for it to finish.
    pub async fn stop(self, controller: &CancellationController) -> MonitorExit {
        self.token.cancel();
        controller.stop_loop(&self.name);
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!(monitor = %self.name, error = %e, "monitor task panicked");
                MonitorExit::Stopped
            }
        }
    }
}
