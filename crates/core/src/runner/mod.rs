//! Subprocess runner for stages wrapping external tools.
//!
//! The runner starts a command in its own process group, streams stdout line
//! by line into the [`ProgressAggregator`], and tears the whole group down
//! when the run is cancelled. Cancellation yields an
//! [`ExecutionOutcome::Cancelled`] result, never a failure.

pub mod output;

use crate::cancel::signal::{self, Signal};
use crate::cancel::{CancellationController, SubprocessHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::paths::Placeholders;
use crate::progress::ProgressAggregator;
use ak_protocol::pipeline_models::{CommandDefinition, ProgressRange, SuccessMode};
use output::{collect_tail, finish_tail, output_lines, ProgressParser};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_stream::StreamExt;

/// Upper bound on waiting for the stderr collector after the process exited.
const STDERR_DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// How long stdout may stay open after the process exited.
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// How long to wait for the group to vanish after SIGKILL.
const GROUP_EXIT_LIMIT: Duration = Duration::from_millis(500);

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A fully expanded command ready to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub success: SuccessMode,
    pub sentinel: Option<String>,
    pub progress: Option<ProgressParser>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
            success: SuccessMode::ExitCode,
            sentinel: None,
            progress: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Succeed on a printed sentinel token, according to `mode`.
    pub fn sentinel(mut self, token: impl Into<String>, mode: SuccessMode) -> Self {
        self.sentinel = Some(token.into());
        self.success = mode;
        self
    }

    pub fn progress(mut self, parser: ProgressParser) -> Self {
        self.progress = Some(parser);
        self
    }

    /// Build a command from its definition, expanding placeholders.
    ///
    /// Relative working directories resolve against `stage_dir`.
    pub fn from_definition(
        stage: &str,
        definition: &CommandDefinition,
        placeholders: &Placeholders,
        stage_dir: &Path,
    ) -> PipelineResult<Self> {
        let expand = |value: &str| placeholders.expand_for(stage, value);

        let cwd = match &definition.cwd {
            Some(cwd) => stage_dir.join(expand(cwd)?),
            None => stage_dir.to_path_buf(),
        };

        let progress = match &definition.progress_regex {
            Some(pattern) => Some(ProgressParser::new(pattern, definition.progress_max).map_err(
                |e| PipelineError::InvalidPipeline {
                    pipeline: stage.to_string(),
                    reason: format!("bad progress-regex: {e}"),
                },
            )?),
            None => None,
        };

        Ok(Self {
            program: expand(&definition.program)?,
            args: definition
                .args
                .iter()
                .map(|a| expand(a))
                .collect::<PipelineResult<_>>()?,
            cwd,
            env: definition
                .env
                .iter()
                .map(|(k, v)| Ok((k.clone(), expand(v)?)))
                .collect::<PipelineResult<_>>()?,
            success: definition.success,
            sentinel: definition.sentinel.clone(),
            progress,
        })
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Result of running one subprocess.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code, `None` when killed by a signal or never launched.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub sentinel_found: bool,

    /// Last stderr lines, surfaced only on failure.
    pub stderr_tail: String,

    pub outcome: ExecutionOutcome,

    /// Process id, `None` when the process was never launched.
    pub pid: Option<u32>,

    pub elapsed: Duration,
}

impl ExecutionResult {
    fn not_launched() -> Self {
        Self {
            exit_code: None,
            success: false,
            sentinel_found: false,
            stderr_tail: String::new(),
            outcome: ExecutionOutcome::Cancelled,
            pid: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Convert into the stage-level result.
    pub fn into_stage_result(self, stage: &str) -> PipelineResult<Self> {
        match self.outcome {
            ExecutionOutcome::Succeeded => Ok(self),
            ExecutionOutcome::Cancelled => Err(PipelineError::Cancelled {
                stage: stage.to_string(),
            }),
            ExecutionOutcome::Failed => {
                let detail = match self.exit_code {
                    Some(code) => format!("process exited with code {code} and printed no success marker"),
                    None => "process was terminated by a signal".to_string(),
                };
                Err(PipelineError::SubprocessFailure {
                    stage: stage.to_string(),
                    exit_code: self.exit_code,
                    detail,
                    stderr_tail: self.stderr_tail,
                })
            }
        }
    }
}

/// Whether a finished process counts as successful under `mode`.
pub fn is_success(mode: SuccessMode, exit_code: Option<i32>, sentinel_found: bool) -> bool {
    let exit_ok = exit_code == Some(0);
    match mode {
        SuccessMode::ExitCode => exit_ok,
        SuccessMode::Sentinel => sentinel_found,
        SuccessMode::Either => exit_ok || sentinel_found,
    }
}

/// Launches external commands on behalf of stages.
pub struct SubprocessRunner {
    controller: Arc<CancellationController>,
    stderr_tail_lines: usize,
}

impl SubprocessRunner {
    pub fn new(controller: Arc<CancellationController>, stderr_tail_lines: usize) -> Self {
        Self {
            controller,
            stderr_tail_lines,
        }
    }

    /// Run `command` for `stage`, streaming stdout into `progress`.
    ///
    /// Nothing is launched when cancellation was already requested.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SubprocessLaunch`] when the command cannot be
    /// started. Failures and cancellation after launch are reported through
    /// [`ExecutionResult::outcome`].
    pub async fn run(
        &self,
        stage: &str,
        range: ProgressRange,
        command: &CommandSpec,
        progress: &mut ProgressAggregator,
    ) -> PipelineResult<ExecutionResult> {
        if self.controller.is_cancelled() {
            return Ok(ExecutionResult::not_launched());
        }

        let launch_error = |reason: String| PipelineError::SubprocessLaunch {
            stage: stage.to_string(),
            program: command.program.clone(),
            reason,
        };

        let program = resolve_program(&command.program).map_err(launch_error)?;
        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            // New session: the child leads its own process group.
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("failed to spawn: {e}")))?;
        let pid = child.id();
        tracing::info!(stage, program = %program.display(), ?pid, cwd = %command.cwd.display(), "launched subprocess");

        if let Some(pid) = pid {
            self.controller.register(SubprocessHandle::new(stage, pid));
        }

        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| collect_tail(stderr, self.stderr_tail_lines));

        let Some(stdout) = child.stdout.take() else {
            self.teardown(stage, &mut child, pid).await;
            self.release(stage, pid);
            return Err(launch_error("failed to capture stdout".to_string()));
        };

        let mut lines = output_lines(stdout);
        let mut sentinel_found = false;
        let mut cancelled = false;
        let mut exit_code = None;
        let mut exited = false;
        let mut stdout_open = true;

        // Armed once the child exits; background helpers may keep stdout open.
        let drain = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(drain);

        while stdout_open || !exited {
            tokio::select! {
                biased;
                _ = self.controller.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = lines.next(), if stdout_open => match next {
                    Some(Ok(line)) => {
                        sentinel_found |= forward_line(stage, range, command, line, progress).await;
                        if self.controller.is_cancelled() {
                            cancelled = true;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(stage, error = %e, "stdout read failed, waiting for exit");
                        stdout_open = false;
                    }
                    None => stdout_open = false,
                },
                status = child.wait(), if !exited => {
                    exited = true;
                    match status {
                        Ok(status) => exit_code = status.code(),
                        Err(e) => tracing::warn!(stage, error = %e, "failed to wait for subprocess"),
                    }
                    drain.as_mut().reset(tokio::time::Instant::now() + OUTPUT_DRAIN_LIMIT);
                }
                _ = &mut drain, if exited && stdout_open => {
                    tracing::debug!(stage, ?pid, "stdout still held open after exit");
                    break;
                }
            }
        }
        drop(lines);

        if cancelled {
            self.teardown(stage, &mut child, pid).await;
        } else if let Some(pid) = pid {
            // Reap helpers the tool left behind in its group.
            if signal::group_alive(pid) {
                tracing::debug!(stage, pid, "terminating leftover process group members");
                let _ = signal::signal_group(pid, Signal::Kill);
            }
        }
        self.release(stage, pid);

        let stderr_tail = match stderr_tail {
            Some(handle) => finish_tail(handle, STDERR_DRAIN_LIMIT).await,
            None => String::new(),
        };

        let success = !cancelled && is_success(command.success, exit_code, sentinel_found);
        let outcome = if cancelled {
            ExecutionOutcome::Cancelled
        } else if success {
            ExecutionOutcome::Succeeded
        } else {
            ExecutionOutcome::Failed
        };
        tracing::info!(stage, ?pid, ?exit_code, sentinel_found, ?outcome, "subprocess finished");

        Ok(ExecutionResult {
            exit_code,
            success,
            sentinel_found,
            stderr_tail,
            outcome,
            pid,
            elapsed: started.elapsed(),
        })
    }

    /// SIGTERM the process group, escalate to SIGKILL for anything in the
    /// group still alive after the grace period, then reap the child.
    async fn teardown(&self, stage: &str, child: &mut Child, pid: Option<u32>) {
        let Some(pid) = pid else {
            return;
        };
        let grace = self.controller.policy().grace;
        let deadline = tokio::time::Instant::now() + grace;

        if let Err(e) = signal::signal_group(pid, Signal::Terminate) {
            tracing::warn!(stage, pid, error = %e, "SIGTERM failed");
        }

        let exited = tokio::time::timeout_at(deadline, child.wait()).await.is_ok();
        if exited && wait_for_group_exit(pid, deadline).await {
            tracing::info!(stage, pid, "process group terminated");
            return;
        }

        tracing::warn!(stage, pid, ?grace, exited, "process group ignored SIGTERM, killing");
        let _ = signal::signal_group(pid, Signal::Kill);
        if !exited {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let settle = tokio::time::Instant::now() + GROUP_EXIT_LIMIT;
        if !wait_for_group_exit(pid, settle).await {
            tracing::warn!(stage, pid, "process group still present after SIGKILL");
        }
    }

    fn release(&self, stage: &str, pid: Option<u32>) {
        if let Some(pid) = pid {
            self.controller.unregister(stage, pid);
        }
    }
}

/// Handle one stdout line. Returns whether it carried the sentinel.
async fn forward_line(
    stage: &str,
    range: ProgressRange,
    command: &CommandSpec,
    line: String,
    progress: &mut ProgressAggregator,
) -> bool {
    tracing::trace!(stage, %line, "stdout");
    let sentinel = command
        .sentinel
        .as_ref()
        .is_some_and(|token| line.contains(token.as_str()));
    match command.progress.as_ref().and_then(|p| p.parse(&line)) {
        Some(local) => {
            let message = line.trim().to_string();
            progress.report(stage, range, local, message, Some(line)).await;
        }
        None => progress.line(stage, range, line).await,
    }
    sentinel
}

/// Poll until no member of the group is left or `deadline` passes.
async fn wait_for_group_exit(pid: u32, deadline: tokio::time::Instant) -> bool {
    loop {
        if !signal::group_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL).await;
    }
}

/// Resolve a bare program name on `PATH`; paths are used as given.
fn resolve_program(program: &str) -> Result<PathBuf, String> {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).map_err(|e| format!("'{program}' not found on PATH: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_modes() {
        assert!(is_success(SuccessMode::ExitCode, Some(0), false));
        assert!(!is_success(SuccessMode::ExitCode, Some(1), true));
        assert!(is_success(SuccessMode::Sentinel, Some(1), true));
        assert!(!is_success(SuccessMode::Sentinel, Some(0), false));
        assert!(is_success(SuccessMode::Either, Some(3), true));
        assert!(is_success(SuccessMode::Either, Some(0), false));
        assert!(!is_success(SuccessMode::Either, None, false));
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program("./run.sh"), Ok(PathBuf::from("./run.sh")));
        assert!(resolve_program("definitely-not-a-real-tool-xyz").is_err());
    }

    #[test]
    fn test_from_definition_expands_placeholders() {
        let definition = CommandDefinition {
            program: "run-solver".to_string(),
            args: vec!["--rate".to_string(), "{flow_rate}".to_string(), "{case_dir}".to_string()],
            cwd: Some("run".to_string()),
            env: [("CASE".to_string(), "{stage_dir}".to_string())].into_iter().collect(),
            success: SuccessMode::Either,
            sentinel: Some("Finished".to_string()),
            progress_regex: Some(r"^Time = (\d+)".to_string()),
            progress_max: 20.0,
        };
        let stage_dir = Path::new("/cases/p1/cfd/10LPM");
        let placeholders = Placeholders::new(
            Path::new("/cases/p1"),
            &ak_protocol::run_models::RunParams::with_flow_rate(10.0),
        )
        .with_stage_dir(stage_dir);

        let spec = CommandSpec::from_definition("solver", &definition, &placeholders, stage_dir).unwrap();
        assert_eq!(spec.args, vec!["--rate", "10", "/cases/p1"]);
        assert_eq!(spec.cwd, PathBuf::from("/cases/p1/cfd/10LPM/run"));
        assert_eq!(spec.env, vec![("CASE".to_string(), "/cases/p1/cfd/10LPM".to_string())]);
        assert_eq!(spec.sentinel.as_deref(), Some("Finished"));
        assert_eq!(spec.progress.unwrap().parse("Time = 5"), Some(25.0));
    }

    #[test]
    fn test_from_definition_rejects_bad_regex() {
        let definition = CommandDefinition {
            program: "tool".to_string(),
            args: vec![],
            cwd: None,
            env: Default::default(),
            success: SuccessMode::ExitCode,
            sentinel: None,
            progress_regex: Some("(unclosed".to_string()),
            progress_max: 100.0,
        };
        let placeholders =
            Placeholders::new(Path::new("/c"), &ak_protocol::run_models::RunParams::default());
        let result = CommandSpec::from_definition("seg", &definition, &placeholders, Path::new("/c"));
        assert!(matches!(result, Err(PipelineError::InvalidPipeline { .. })));
    }
}
