//! End-to-end workflows driven through a started master with recording
//! workers.

mod common;

use common::{settle, Cluster};
use dagger_master::model::{task_types, ParamPool, TaskCode};
use dagger_master::registry::paths;
use dagger_master::{
    MasterCommand, Persistence, TaskDefinition, TaskStatus, WorkflowCommand, WorkflowDefinition, WorkflowStatus,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::oneshot;

fn shell(code: TaskCode) -> TaskDefinition {
    TaskDefinition::new(code, format!("t{}", code), "SHELL")
}

fn chain(codes: &[TaskCode]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(100, "chain");
    for &code in codes {
        def = def.task(shell(code));
    }
    for pair in codes.windows(2) {
        def = def.relation(pair[0], pair[1]);
    }
    def
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_linear_workflow_runs_to_success() {
    let cluster = Cluster::start().await;
    let id = cluster.server.start_workflow(&chain(&[1, 2, 3]), ParamPool::new()).await.unwrap();

    for code in [1, 2, 3] {
        cluster.wait_dispatched(code, 1).await;
        cluster.running(code).await;
        cluster.succeed(code).await;
    }
    cluster.wait_status(id, WorkflowStatus::Success).await;
    assert_eq!(cluster.client.codes(), vec![1, 2, 3]);

    let (_, request) = cluster.client.last(2).unwrap();
    assert_eq!(request.master_host, "m1:5678");
    assert_eq!(request.workflow_instance_id, id);
    assert!(common::eventually(|| async { !cluster.server.cache().contains(id) }).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_through_command_channel() {
    let cluster = Cluster::start().await;
    let (reply, rx) = oneshot::channel();
    cluster
        .server
        .sender()
        .send(MasterCommand::StartWorkflow {
            definition: chain(&[1]),
            params: ParamPool::new(),
            reply,
        })
        .await
        .unwrap();
    let id = rx.await.unwrap().unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.succeed(1).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_without_retries_fails_workflow() {
    let cluster = Cluster::start().await;
    let id = cluster.server.start_workflow(&chain(&[1, 2, 3]), ParamPool::new()).await.unwrap();

    for code in [1, 2] {
        cluster.wait_dispatched(code, 1).await;
        cluster.succeed(code).await;
    }
    cluster.wait_dispatched(3, 1).await;
    cluster.fail(3).await;
    cluster.wait_status(id, WorkflowStatus::Failure).await;

    settle().await;
    assert_eq!(cluster.client.codes(), vec![1, 2, 3]);
    let attempts = cluster.server.storage().task_instances(id).await.unwrap();
    assert_eq!(attempts.iter().filter(|t| t.task_code == 3).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_are_bounded() {
    let cluster = Cluster::start().await;
    let def = WorkflowDefinition::new(100, "flaky").task(shell(1).with_retries(2, None));
    let id = cluster.server.start_workflow(&def, ParamPool::new()).await.unwrap();

    for attempt in 1..=3 {
        cluster.wait_dispatched(1, attempt).await;
        cluster.fail(1).await;
    }
    cluster.wait_status(id, WorkflowStatus::Failure).await;

    settle().await;
    assert_eq!(cluster.client.dispatch_count(1), 3);
    let retry_counts: Vec<u32> = cluster
        .client
        .dispatched
        .lock()
        .iter()
        .map(|(_, r)| r.retry_count)
        .collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_params_override_globals() {
    let cluster = Cluster::start().await;
    let def = WorkflowDefinition::new(100, "params")
        .global_param("table", json!("staging"))
        .task(shell(1).with_params(json!({"script": "load ${table}"})));
    let mut params = ParamPool::new();
    params.insert("table".into(), json!("orders"));
    cluster.server.start_workflow(&def, params).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    let (_, request) = cluster.client.last(1).unwrap();
    assert_eq!(request.params, json!({"script": "load orders"}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_runs_only_selected_branch() {
    let cluster = Cluster::start().await;
    let switch = TaskDefinition::new(2, "route", task_types::SWITCH).with_params(json!({
        "cases": [
            {"condition": "${x} > 5", "next": [3]},
            {"condition": "${x} <= 5", "next": [4]}
        ],
        "default_next": [3]
    }));
    let def = WorkflowDefinition::new(100, "switch")
        .task(shell(1))
        .task(switch)
        .task(shell(3))
        .task(shell(4))
        .relation(1, 2)
        .relation(2, 3)
        .relation(2, 4);
    let id = cluster.server.start_workflow(&def, ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    let mut vars = ParamPool::new();
    vars.insert("x".into(), json!(3));
    cluster.succeed_with(1, vars).await;

    cluster.wait_dispatched(4, 1).await;
    cluster.succeed(4).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
    assert_eq!(cluster.client.codes(), vec![1, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_conditions_follow_failed_branch() {
    let cluster = Cluster::start().await;
    let conditions = TaskDefinition::new(2, "check", task_types::CONDITIONS).with_params(json!({
        "dependence": {"groups": [{"items": [{"task_code": 1}]}]},
        "success_node": [3],
        "failed_node": [4]
    }));
    let def = WorkflowDefinition::new(100, "conditions")
        .task(shell(1))
        .task(conditions)
        .task(shell(3))
        .task(shell(4))
        .relation(1, 2)
        .relation(2, 3)
        .relation(2, 4);
    let id = cluster.server.start_workflow(&def, ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.fail(1).await;
    cluster.wait_dispatched(4, 1).await;
    cluster.succeed(4).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
    assert_eq!(cluster.client.codes(), vec![1, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_parks_instance_until_resume() {
    let cluster = Cluster::start().await;
    let blocking = TaskDefinition::new(2, "gate", task_types::BLOCKING).with_params(json!({
        "dependence": {"groups": [{"items": [{"task_code": 1, "status": "SUCCESS"}]}]},
        "blocking_condition": "BLOCKING_ON_FAILED"
    }));
    let def = WorkflowDefinition::new(100, "blocking")
        .task(shell(1))
        .task(blocking)
        .task(shell(3))
        .task(shell(9))
        .relation(1, 2)
        .relation(2, 3);
    let id = cluster.server.start_workflow(&def, ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.wait_dispatched(9, 1).await;
    cluster.fail(1).await;
    cluster.wait_status(id, WorkflowStatus::ReadyBlock).await;
    cluster.succeed(9).await;
    cluster.wait_status(id, WorkflowStatus::Block).await;

    let stored = cluster.server.storage().get_workflow_instance(id).await.unwrap().unwrap();
    assert!(stored.blocked);
    assert_eq!(cluster.client.dispatch_count(3), 0);
    assert!(common::eventually(|| async { !cluster.server.cache().contains(id) }).await);

    cluster.server.control(id, WorkflowCommand::Resume).await.unwrap();
    cluster.wait_dispatched(3, 1).await;
    cluster.succeed(3).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_finish_is_ignored() {
    let cluster = Cluster::start().await;
    let id = cluster.server.start_workflow(&chain(&[1, 2]), ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.succeed(1).await;
    cluster.succeed(1).await;
    cluster.wait_dispatched(2, 1).await;
    settle().await;
    assert_eq!(cluster.client.dispatch_count(2), 1);

    cluster.succeed(2).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_then_resume() {
    let cluster = Cluster::start().await;
    let id = cluster.server.start_workflow(&chain(&[1, 2]), ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.server.control(id, WorkflowCommand::Pause).await.unwrap();
    cluster.wait_status(id, WorkflowStatus::ReadyPause).await;
    cluster.succeed(1).await;
    cluster.wait_status(id, WorkflowStatus::Pause).await;
    settle().await;
    assert_eq!(cluster.client.dispatch_count(2), 0);

    cluster.server.control(id, WorkflowCommand::Resume).await.unwrap();
    cluster.wait_dispatched(2, 1).await;
    cluster.succeed(2).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_kills_running_tasks() {
    let cluster = Cluster::start().await;
    let id = cluster.server.start_workflow(&chain(&[1, 2]), ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.running(1).await;
    cluster.server.control(id, WorkflowCommand::Stop).await.unwrap();
    cluster.wait_status(id, WorkflowStatus::ReadyStop).await;
    assert_eq!(*cluster.client.killed.lock(), vec![cluster.client.last_id(1)]);

    cluster.report(1, TaskStatus::Kill).await;
    cluster.wait_status(id, WorkflowStatus::Stop).await;
    assert_eq!(cluster.client.dispatch_count(2), 0);

    // commands for finished instances are dropped quietly
    cluster.server.control(id, WorkflowCommand::Resume).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_worker_task_is_dispatched_elsewhere() {
    let cluster = Cluster::start().await;
    let id = cluster.server.start_workflow(&chain(&[1]), ParamPool::new()).await.unwrap();

    cluster.wait_dispatched(1, 1).await;
    cluster.running(1).await;
    let (lost, _) = cluster.client.last(1).unwrap();
    assert!(cluster.registry.expire(&paths::worker_path("default", &lost)));

    cluster.wait_dispatched(1, 2).await;
    let (host, request) = cluster.client.last(1).unwrap();
    assert_ne!(host, lost);
    assert_eq!(request.retry_count, 0);

    cluster.succeed(1).await;
    cluster.wait_status(id, WorkflowStatus::Success).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_task_event_is_rejected() {
    let cluster = Cluster::start().await;
    let event = dagger_master::TaskExecutionEvent::succeeded(9_999, ParamPool::new());
    assert!(cluster.server.route_task_event(event).await.is_err());
}
