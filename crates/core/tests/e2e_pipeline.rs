//! End-to-end tests driving the RunManager through Ops, the way a front end
//! does.

mod common;

use ak_core::error::PipelineError;
use ak_core::state::manager::RunManager;
use ak_protocol::ipc::{Event, Op};
use ak_protocol::run_models::{ResumeMode, RunParams, RunStatus};
use common::*;
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_ops_start_cancel_cleanup_shutdown() {
    let mut bench = Workbench::new();
    bench.set_env("solver", "END_STEP", "500");
    bench.set_env("solver", "STEP_DELAY", "1");

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (ops_tx, ops_rx) = mpsc::channel(8);
    let manager = Arc::new(RunManager::new(bench.app_config(), events_tx));
    let server = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.serve(ops_rx).await })
    };

    ops_tx
        .send(Op::StartRun {
            case_dir: bench.case_dir.clone(),
            pipeline_name: "airway-cfd".to_string(),
            params: RunParams::with_flow_rate(15.0),
            resume: ResumeMode::ReuseExisting,
        })
        .await
        .unwrap();

    let mut run_id = None;
    while let Some(event) = events_rx.recv().await {
        match event {
            Event::RunStarted { run_id: id, .. } => run_id = Some(id),
            Event::Progress { event, .. } if event.raw_line.as_deref() == Some("Time = 0") => {
                break
            }
            _ => {}
        }
    }
    let run_id = run_id.unwrap();

    ops_tx.send(Op::CancelRun { run_id }).await.unwrap();
    while let Some(event) = events_rx.recv().await {
        if let Event::RunCancelled { stage, .. } = event {
            assert_eq!(stage.as_deref(), Some("solver"));
            break;
        }
    }

    ops_tx
        .send(Op::CleanupPartial {
            run_id,
            stage: "solver".to_string(),
        })
        .await
        .unwrap();
    loop {
        match events_rx.recv().await {
            Some(Event::CleanupFinished { stage, removed, .. }) => {
                assert_eq!(stage, "solver");
                assert!(removed);
                break;
            }
            Some(_) => {}
            None => panic!("event channel closed before cleanup finished"),
        }
    }
    assert!(!bench.solver_dir("15").exists());
    assert_eq!(
        manager.get_run(run_id).await.unwrap().status,
        RunStatus::Cancelled
    );

    ops_tx.send(Op::Shutdown).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_one_active_run_per_case_and_params() {
    let mut bench = Workbench::new();
    bench.set_env("solver", "END_STEP", "500");
    bench.set_env("solver", "STEP_DELAY", "1");

    let (events_tx, events_rx) = mpsc::channel(256);
    let _collector = collect_events(events_rx);
    let manager = RunManager::new(bench.app_config(), events_tx);
    let params = RunParams::with_flow_rate(15.0);

    let first = manager
        .start_run(&bench.case_dir, "airway-cfd", params, ResumeMode::ReuseExisting)
        .await
        .unwrap();

    match manager
        .start_run(&bench.case_dir, "airway-cfd", params, ResumeMode::ReuseExisting)
        .await
    {
        Err(PipelineError::RunAlreadyActive { run_id, .. }) => assert_eq!(run_id, first.id()),
        other => panic!("Expected RunAlreadyActive, got {:?}", other.map(|h| h.id())),
    }
    assert_eq!(
        manager.active_run(&bench.case_dir, &params).await,
        Some(first.id())
    );

    manager.cancel_run(first.id()).await.unwrap();
    assert_eq!(first.wait().await.status, RunStatus::Cancelled);
    assert_eq!(manager.active_run(&bench.case_dir, &params).await, None);

    // A finished run for the same key is replaced.
    let second = manager
        .start_run(&bench.case_dir, "airway-cfd", params, ResumeMode::ReuseExisting)
        .await
        .unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(manager.run_count().await, 1);

    let report = manager.discard_run(second.id()).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(manager.run_count().await, 0);
}

#[tokio::test]
async fn test_unknown_pipeline_is_rejected() {
    let bench = Workbench::new();
    let (events_tx, _events_rx) = mpsc::channel(8);
    let manager = RunManager::new(bench.app_config(), events_tx);

    let result = manager
        .start_run(
            &bench.case_dir,
            "no-such-pipeline",
            RunParams::default(),
            ResumeMode::ReuseExisting,
        )
        .await;

    assert!(matches!(result, Err(PipelineError::InvalidPipeline { .. })));
    assert_eq!(manager.run_count().await, 0);
}
