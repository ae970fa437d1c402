//! Cancellation controller for one pipeline run.
//!
//! The controller owns the run's cancel flag, the registry of live
//! subprocesses and the registry of cooperative loops (residual monitors).
//! Subprocess runners and monitors opt in by registering themselves, so the
//! orchestrator never needs direct references to them.

pub mod signal;

use chrono::{DateTime, Utc};
use signal::Signal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a live subprocess is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
}

impl TerminationPolicy {
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
        }
    }
}

/// A live subprocess registered with the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessHandle {
    /// Stage that launched the process.
    pub stage: String,

    /// Process id, which is also the process-group id.
    pub pid: u32,

    pub started_at: DateTime<Utc>,
}

impl SubprocessHandle {
    pub fn new(stage: impl Into<String>, pid: u32) -> Self {
        Self {
            stage: stage.into(),
            pid,
            started_at: Utc::now(),
        }
    }
}

type ProcessRegistry = Arc<Mutex<HashMap<String, Vec<SubprocessHandle>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cancellation state of a pipeline run.
///
/// # Example
///
/// ```
/// use ak_core::cancel::CancellationController;
///
/// let controller = CancellationController::default();
/// assert!(controller.request_cancel());
/// assert!(!controller.request_cancel());
/// assert!(controller.is_cancelled());
/// ```
pub struct CancellationController {
    requested: AtomicBool,
    token: CancellationToken,
    policy: TerminationPolicy,
    processes: ProcessRegistry,
    loops: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationController {
    pub fn new(policy: TerminationPolicy) -> Self {
        Self {
            requested: AtomicBool::new(false),
            token: CancellationToken::new(),
            policy,
            processes: Arc::new(Mutex::new(HashMap::new())),
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> TerminationPolicy {
        self.policy
    }

    /// Request cancellation of the run.
    ///
    /// Only the first call has an effect: it sets the flag, wakes every
    /// cooperative waiter, sends SIGTERM to every registered process group
    /// and schedules SIGKILL for groups still registered after the grace
    /// period. Returns `true` for the call that flipped the flag.
    ///
    /// Never blocks.
    pub fn request_cancel(&self) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            return false;
        }

        tracing::info!("cancellation requested");
        self.token.cancel();

        let live = self.live_handles();
        for handle in &live {
            terminate(handle, Signal::Terminate);
        }
        if !live.is_empty() {
            self.schedule_kill(live);
        }
        true
    }

    /// Fast, lock-free read of the cancel flag.
    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + '_ {
        self.token.cancelled()
    }

    /// Register a live subprocess.
    ///
    /// A process registered after cancellation was requested is signalled
    /// immediately.
    pub fn register(&self, handle: SubprocessHandle) {
        tracing::debug!(stage = %handle.stage, pid = handle.pid, "subprocess registered");
        let late = self.is_cancelled();
        lock(&self.processes)
            .entry(handle.stage.clone())
            .or_default()
            .push(handle.clone());

        if late {
            terminate(&handle, Signal::Terminate);
            self.schedule_kill(vec![handle]);
        }
    }

    /// Remove a subprocess once it has been reaped.
    pub fn unregister(&self, stage: &str, pid: u32) -> Option<SubprocessHandle> {
        let mut processes = lock(&self.processes);
        let handles = processes.get_mut(stage)?;
        let position = handles.iter().position(|h| h.pid == pid)?;
        let handle = handles.remove(position);
        if handles.is_empty() {
            processes.remove(stage);
        }
        tracing::debug!(stage, pid, "subprocess unregistered");
        Some(handle)
    }

    /// Snapshot of every registered subprocess.
    pub fn live_handles(&self) -> Vec<SubprocessHandle> {
        lock(&self.processes).values().flatten().cloned().collect()
    }

    /// Subprocesses registered by one stage.
    pub fn handles_for(&self, stage: &str) -> Vec<SubprocessHandle> {
        lock(&self.processes)
            .get(stage)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a cooperative loop and return the token it must watch.
    ///
    /// The token is a child of the run token: it fires on run cancellation
    /// or when [`stop_loop`](Self::stop_loop) is called for the same name.
    pub fn register_loop(&self, name: &str) -> CancellationToken {
        let token = self.token.child_token();
        if let Some(previous) = lock(&self.loops).insert(name.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Stop one cooperative loop without cancelling the run.
    pub fn stop_loop(&self, name: &str) -> bool {
        match lock(&self.loops).remove(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Names of the cooperative loops still registered.
    pub fn active_loops(&self) -> Vec<String> {
        lock(&self.loops).keys().cloned().collect()
    }

    fn schedule_kill(&self, handles: Vec<SubprocessHandle>) {
        let registry = Arc::clone(&self.processes);
        let grace = self.policy.grace;

        let escalate = move || {
            let still_live: Vec<SubprocessHandle> = {
                let processes = lock(&registry);
                handles
                    .into_iter()
                    .filter(|h| {
                        processes
                            .get(&h.stage)
                            .is_some_and(|live| live.iter().any(|l| l.pid == h.pid))
                    })
                    .collect()
            };
            for handle in &still_live {
                terminate(handle, Signal::Kill);
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    escalate();
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(grace);
                    escalate();
                });
            }
        }
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new(TerminationPolicy::default())
    }
}

fn terminate(handle: &SubprocessHandle, signal: Signal) {
    match signal::signal_group(handle.pid, signal) {
        Ok(true) => {
            tracing::info!(stage = %handle.stage, pid = handle.pid, ?signal, "signalled process group");
        }
        Ok(false) => {
            tracing::debug!(stage = %handle.stage, pid = handle.pid, "process group already gone");
        }
        Err(e) => {
            tracing::warn!(stage = %handle.stage, pid = handle.pid, error = %e, "failed to signal process group");
        }
    }
}
