//! Run state machine implementation.
//!
//! This module provides functions for managing the lifecycle of a
//! [`RunReport`], including run and stage transitions and event emission.

use ak_protocol::ipc::Event;
use ak_protocol::run_models::{
    RunParams, RunReport, RunStatus, StageFailure, StageOutcome, StageStatus,
};
use chrono::Utc;
use std::path::PathBuf;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

/// Create a new report with Pending status and one pending entry per stage.
///
/// # Arguments
///
/// * `id` - Identifier of the run
/// * `pipeline_name` - The name of the pipeline being executed
/// * `case_dir` - Directory of the clinical case
/// * `params` - Parameter set of the run
/// * `stages` - Stage names in execution order
pub fn create_report<'a>(
    id: Uuid,
    pipeline_name: String,
    case_dir: PathBuf,
    params: RunParams,
    stages: impl IntoIterator<Item = &'a str>,
) -> RunReport {
    RunReport {
        id,
        pipeline_name,
        case_dir,
        params,
        status: RunStatus::Pending,
        current_stage: 0,
        progress: 0.0,
        last_message: String::new(),
        stages: stages.into_iter().map(StageOutcome::pending).collect(),
        failure: None,
        started_at: Utc::now(),
        finished_at: None,
    }
}

async fn emit_status(report: &RunReport, events_tx: &Sender<Event>) {
    let _ = events_tx
        .send(Event::RunStatusUpdate {
            run_id: report.id,
            status: report.status,
            stage_index: report.current_stage,
        })
        .await;
}

/// Transition the run to Running status and emit events.
///
/// # Arguments
///
/// * `report` - The run to start
/// * `events_tx` - Channel to send status update events
pub async fn start_run(report: &mut RunReport, events_tx: &Sender<Event>) {
    let _ = events_tx
        .send(Event::RunStarted {
            run_id: report.id,
            pipeline_name: report.pipeline_name.clone(),
            case_dir: report.case_dir.clone(),
            params: report.params,
        })
        .await;

    report.status = RunStatus::Running;
    emit_status(report, events_tx).await;
}

/// Transition to Cancelling once the worker observes a cancel request.
///
/// Does nothing when the run is already cancelling or finished.
pub async fn mark_cancelling(report: &mut RunReport, events_tx: &Sender<Event>) {
    if matches!(report.status, RunStatus::Pending | RunStatus::Running) {
        report.status = RunStatus::Cancelling;
        emit_status(report, events_tx).await;
    }
}

/// Move to the stage at `index`.
pub fn advance_stage(report: &mut RunReport, index: usize) {
    report.current_stage = index;
}

/// Record a stage transition and emit event.
///
/// # Arguments
///
/// * `report` - The run owning the stage
/// * `events_tx` - Channel to send the stage update
/// * `index` - Index of the stage
/// * `status` - New stage status
/// * `skipped` - Whether the stage completed by reusing existing artifacts
pub async fn set_stage_status(
    report: &mut RunReport,
    events_tx: &Sender<Event>,
    index: usize,
    status: StageStatus,
    skipped: bool,
) {
    let Some(outcome) = report.stages.get_mut(index) else {
        return;
    };

    let now = Utc::now();
    match status {
        StageStatus::Pending => {}
        StageStatus::Running => outcome.started_at = Some(now),
        StageStatus::Completed | StageStatus::Failed | StageStatus::Cancelled => {
            outcome.started_at.get_or_insert(now);
            outcome.finished_at = Some(now);
        }
    }
    outcome.status = status;
    outcome.skipped = skipped;

    let _ = events_tx
        .send(Event::StageStatusUpdate {
            run_id: report.id,
            stage: outcome.name.clone(),
            status,
            skipped,
        })
        .await;
}

/// Mark the run as completed.
///
/// Terminal transitions only update the report; the worker publishes the
/// new status to handles and then calls [`emit_terminal`].
pub fn complete_run(report: &mut RunReport) {
    report.status = RunStatus::Completed;
    report.finished_at = Some(Utc::now());
}

/// Mark the run as failed.
///
/// # Arguments
///
/// * `report` - The run to fail
/// * `failure` - Failing stage, error detail and stderr tail
pub fn fail_run(report: &mut RunReport, failure: StageFailure) {
    report.status = RunStatus::Failed;
    report.finished_at = Some(Utc::now());
    report.failure = Some(failure);
}

/// Mark the run as cancelled once teardown has finished.
pub fn cancel_run(report: &mut RunReport) {
    report.status = RunStatus::Cancelled;
    report.finished_at = Some(Utc::now());
}

/// Emit the final status update followed by the terminal event.
///
/// Does nothing for a run that has not reached a terminal state.
pub async fn emit_terminal(report: &RunReport, events_tx: &Sender<Event>) {
    let run_id = report.id;
    let event = match report.status {
        RunStatus::Completed => Event::RunCompleted { run_id },
        RunStatus::Failed => {
            let failure = report.failure.clone().unwrap_or_else(|| StageFailure {
                stage: current_stage_name(report).unwrap_or_default(),
                detail: "run failed".to_string(),
                stderr_tail: String::new(),
            });
            Event::RunFailed {
                run_id,
                stage: failure.stage,
                error: failure.detail,
                stderr_tail: failure.stderr_tail,
            }
        }
        RunStatus::Cancelled => Event::RunCancelled {
            run_id,
            stage: current_stage_name(report),
        },
        RunStatus::Pending | RunStatus::Running | RunStatus::Cancelling => return,
    };

    emit_status(report, events_tx).await;
    let _ = events_tx.send(event).await;
}

fn current_stage_name(report: &RunReport) -> Option<String> {
    report
        .stages
        .get(report.current_stage)
        .map(|s| s.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn report() -> RunReport {
        create_report(
            Uuid::new_v4(),
            "airway-cfd".to_string(),
            PathBuf::from("/cases/p1"),
            RunParams::with_flow_rate(15.0),
            ["segmentation", "solver"],
        )
    }

    #[test]
    fn test_create_report() {
        let report = report();
        assert_eq!(report.status, RunStatus::Pending);
        assert_eq!(report.stages.len(), 2);
        assert!(report
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Pending && !s.skipped));
        assert!(report.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_start_run() {
        let mut report = report();
        let (tx, mut rx) = mpsc::channel(10);

        start_run(&mut report, &tx).await;

        assert_eq!(report.status, RunStatus::Running);
        assert!(matches!(rx.recv().await.unwrap(), Event::RunStarted { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::RunStatusUpdate {
                status: RunStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_skip_goes_straight_to_completed() {
        let mut report = report();
        let (tx, mut rx) = mpsc::channel(10);

        set_stage_status(&mut report, &tx, 0, StageStatus::Completed, true).await;

        let outcome = &report.stages[0];
        assert_eq!(outcome.status, StageStatus::Completed);
        assert!(outcome.skipped);
        assert!(outcome.started_at.is_some() && outcome.finished_at.is_some());
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::StageStatusUpdate { skipped: true, status: StageStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn test_mark_cancelling_only_from_active_states() {
        let mut report = report();
        let (tx, mut rx) = mpsc::channel(10);

        complete_run(&mut report);
        mark_cancelling(&mut report, &tx).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_run_records_failure() {
        let mut report = report();
        let (tx, mut rx) = mpsc::channel(10);

        fail_run(
            &mut report,
            StageFailure {
                stage: "solver".to_string(),
                detail: "exit code 1".to_string(),
                stderr_tail: "FOAM FATAL ERROR".to_string(),
            },
        );
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failure.as_ref().unwrap().stage, "solver");

        emit_terminal(&report, &tx).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::RunStatusUpdate { status: RunStatus::Failed, .. }
        ));
        match rx.recv().await.unwrap() {
            Event::RunFailed { stage, stderr_tail, .. } => {
                assert_eq!(stage, "solver");
                assert_eq!(stderr_tail, "FOAM FATAL ERROR");
            }
            other => panic!("Expected RunFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_run_names_current_stage() {
        let mut report = report();
        let (tx, mut rx) = mpsc::channel(10);

        advance_stage(&mut report, 1);
        cancel_run(&mut report);
        emit_terminal(&report, &tx).await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.finished_at.is_some());
        let _status = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            Event::RunCancelled { stage, .. } => assert_eq!(stage.as_deref(), Some("solver")),
            other => panic!("Expected RunCancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_terminal_ignores_active_run() {
        let mut report = report();
        let (tx, mut rx) = mpsc::channel(10);

        start_run(&mut report, &tx).await;
        while rx.try_recv().is_ok() {}

        emit_terminal(&report, &tx).await;
        assert!(rx.try_recv().is_err());
    }
}
