//! Exclusive group admission across concurrent starts.

mod common;

use common::*;
use fg_core::state::Dispatch;
use fg_protocol::config_models::ServerConfig;
use fg_protocol::process_models::{ExclusiveMode, ProcessSpec, ProcessStatus};
use fg_protocol::repository_models::ExclusiveSpec;
use serde_json::json;
use std::sync::Arc;

fn exclusive(mode: ExclusiveMode) -> ProcessSpec {
    ProcessSpec {
        exclusive: Some(ExclusiveSpec {
            group: "RED".to_string(),
            mode,
            ..Default::default()
        }),
        ..flow_spec(json!([{ "log": "working" }]))
    }
}

#[tokio::test]
async fn test_red_group_keeps_only_the_newest_queued_process() {
    let orchestrator = orchestrator(ServerConfig::default()).await;
    let (first, _) = orchestrator.start(exclusive(ExclusiveMode::CancelOld)).await.unwrap();
    let (second, _) = orchestrator.start(exclusive(ExclusiveMode::CancelOld)).await.unwrap();

    assert_status(&orchestrator, first, ProcessStatus::Cancelled).await;
    let cancelled = orchestrator.manager().get(first).await.unwrap();
    assert!(cancelled.log_lines().contains(&format!(
        "Process '{second}' with exclusive group 'RED' is already in the queue. Current process has been cancelled"
    )));

    run_until_idle(&orchestrator).await;
    assert_status(&orchestrator, second, ProcessStatus::Finished).await;
}

#[tokio::test]
async fn test_configuration_declares_the_group() {
    let orchestrator = orchestrator(ServerConfig::default()).await;
    let spec = || ProcessSpec {
        definition: Some(json!({
            "configuration": { "exclusive": { "group": "RED", "mode": "cancel" } },
            "flows": { "main": [{ "log": "working" }] }
        })),
        ..flow_spec(json!([]))
    };

    let (_, first) = orchestrator.start(spec()).await.unwrap();
    let (rejected, second) = orchestrator.start(spec()).await.unwrap();
    assert_eq!(first, ProcessStatus::Enqueued);
    assert_eq!(second, ProcessStatus::Cancelled);
    assert!(orchestrator
        .manager()
        .get(rejected)
        .await
        .unwrap()
        .log_lines()
        .iter()
        .any(|l| l.starts_with("Process(es) with exclusive group 'RED'")));
}

#[tokio::test]
async fn test_wait_mode_runs_one_at_a_time() {
    let orchestrator = orchestrator(ServerConfig::default()).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(orchestrator.start(exclusive(ExclusiveMode::Wait)).await.unwrap().0);
    }
    assert_eq!(orchestrator.manager().runnable().await.len(), 1);

    run_until_idle(&orchestrator).await;

    let mut finished = Vec::new();
    for id in &ids {
        let process = orchestrator.manager().get(*id).await.unwrap();
        assert_eq!(process.status, ProcessStatus::Finished);
        finished.push((process.running_since.unwrap(), process.status_since()));
    }
    // each run starts after the previous one ended
    for pair in finished.windows(2) {
        assert!(pair[1].0 >= pair[0].1);
    }
}

#[tokio::test]
async fn test_branch_partitions_do_not_contend() {
    let orchestrator = orchestrator(ServerConfig::default()).await;
    let on_branch = |branch: &str| ProcessSpec {
        exclusive: Some(ExclusiveSpec {
            group: "RED".to_string(),
            mode: ExclusiveMode::Cancel,
            group_by_branch: true,
            ..Default::default()
        }),
        event_attributes: json!({ "branch": branch }).as_object().cloned().unwrap(),
        ..flow_spec(json!([{ "log": "working" }]))
    };

    let (_, main) = orchestrator.start(on_branch("main")).await.unwrap();
    let (_, dev) = orchestrator.start(on_branch("dev")).await.unwrap();
    let (_, main_again) = orchestrator.start(on_branch("main")).await.unwrap();

    assert_eq!(main, ProcessStatus::Enqueued);
    assert_eq!(dev, ProcessStatus::Enqueued);
    assert_eq!(main_again, ProcessStatus::Cancelled);
}

#[tokio::test]
async fn test_killing_the_holder_admits_the_next_waiter() {
    let orchestrator = orchestrator(ServerConfig::default()).await;
    let manager = orchestrator.manager();
    let (holder, _) = orchestrator.start(exclusive(ExclusiveMode::Wait)).await.unwrap();
    let (waiter, _) = orchestrator.start(exclusive(ExclusiveMode::Wait)).await.unwrap();

    manager.kill(holder).await.unwrap();
    let runnable: Vec<_> = manager.runnable().await.into_iter().map(|p| p.id).collect();
    assert_eq!(runnable, vec![waiter]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_leave_one_live_process() {
    let orchestrator = orchestrator(ServerConfig::default()).await;

    for mode in [ExclusiveMode::Cancel, ExclusiveMode::CancelOld] {
        let spec = ProcessSpec {
            exclusive: Some(ExclusiveSpec {
                group: format!("RED-{mode:?}"),
                mode,
                ..Default::default()
            }),
            ..flow_spec(json!([{ "log": "working" }]))
        };

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(orchestrator.manager());
            let spec = spec.clone();
            tasks.push(tokio::spawn(async move { manager.start(spec).await }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().0);
        }

        let mut live = Vec::new();
        for id in &ids {
            let process = orchestrator.manager().get(*id).await.unwrap();
            if !process.status.is_terminal() {
                assert_eq!(process.status, ProcessStatus::Enqueued);
                live.push(*id);
            }
        }
        assert_eq!(live.len(), 1, "{mode:?} left {live:?}");
        let runnable: Vec<_> = orchestrator
            .manager()
            .runnable()
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(runnable, live);
        for id in live {
            orchestrator.manager().kill(id).await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatched_holder_survives_concurrent_cancel_old() {
    let orchestrator = orchestrator(ServerConfig::default()).await;

    for round in 0..32 {
        let spec = ProcessSpec {
            exclusive: Some(ExclusiveSpec {
                group: format!("RED-{round}"),
                mode: ExclusiveMode::CancelOld,
                ..Default::default()
            }),
            ..flow_spec(json!([{ "log": "working" }]))
        };
        let (first, _) = orchestrator.start(spec.clone()).await.unwrap();

        let manager = Arc::clone(orchestrator.manager());
        let dispatch = tokio::spawn(async move { manager.dispatch(first, "w1").await });
        let manager = Arc::clone(orchestrator.manager());
        let newcomer = tokio::spawn(async move { manager.start(spec).await });

        let dispatched = dispatch.await.unwrap().unwrap();
        let (second, _) = newcomer.await.unwrap().unwrap();

        let first = orchestrator.manager().get(first).await.unwrap();
        let second = orchestrator.manager().get(second).await.unwrap();
        match dispatched {
            Dispatch::Started(_) => {
                assert_eq!(first.status, ProcessStatus::Running, "round {round}");
                assert_eq!(second.status, ProcessStatus::Enqueued, "round {round}");
                assert!(second.awaiting.is_some(), "round {round}");
            }
            _ => {
                assert_eq!(first.status, ProcessStatus::Cancelled, "round {round}");
                assert_eq!(second.status, ProcessStatus::Enqueued, "round {round}");
            }
        }
    }
}
