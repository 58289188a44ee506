//! Shared fixtures for the master integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use dagger_master::dispatch::{DispatchAck, DispatchRequest, Host, HostSelectorKind, WorkerClient};
use dagger_master::model::{ParamPool, TaskCode, TaskInstanceId, WorkflowInstanceId};
use dagger_master::registry::{paths, MemoryRegistry, Registry, WorkerHeartbeat};
use dagger_master::{
    MasterConfig, MasterServer, Persistence, RetryStrategy, TaskExecutionEvent, TaskStatus, WorkflowStatus,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records every RPC instead of talking to real workers.
#[derive(Default)]
pub struct RecordingWorkerClient {
    pub dispatched: Mutex<Vec<(String, DispatchRequest)>>,
    pub killed: Mutex<Vec<TaskInstanceId>>,
    pub take_over: AtomicBool,
}

impl RecordingWorkerClient {
    pub fn codes(&self) -> Vec<TaskCode> {
        self.dispatched.lock().iter().map(|(_, r)| r.task_code).collect()
    }

    pub fn dispatch_count(&self, code: TaskCode) -> usize {
        self.dispatched.lock().iter().filter(|(_, r)| r.task_code == code).count()
    }

    /// Host and request of the latest attempt of `code`
    pub fn last(&self, code: TaskCode) -> Option<(String, DispatchRequest)> {
        self.dispatched
            .lock()
            .iter()
            .rev()
            .find(|(_, r)| r.task_code == code)
            .cloned()
    }

    pub fn last_id(&self, code: TaskCode) -> TaskInstanceId {
        self.last(code).map(|(_, r)| r.task_instance_id).unwrap()
    }
}

#[async_trait]
impl WorkerClient for RecordingWorkerClient {
    async fn dispatch_task(&self, host: &Host, request: &DispatchRequest) -> anyhow::Result<DispatchAck> {
        self.dispatched.lock().push((host.address.clone(), request.clone()));
        Ok(DispatchAck::accepted())
    }

    async fn kill_task(&self, _host: &str, task_instance_id: TaskInstanceId) -> anyhow::Result<()> {
        self.killed.lock().push(task_instance_id);
        Ok(())
    }

    async fn take_over_task(&self, _host: &str, _id: TaskInstanceId, _master: &str) -> anyhow::Result<bool> {
        Ok(self.take_over.load(Ordering::SeqCst))
    }
}

pub fn config(host: &str) -> MasterConfig {
    MasterConfig::builder()
        .listen_host(host)
        .host_selector(HostSelectorKind::RoundRobin)
        .tick_interval(Duration::from_millis(20))
        .default_retry_strategy(RetryStrategy::Immediate)
        .failover(Duration::from_secs(2), Duration::from_millis(200))
        .log_level("debug")
        .build()
        .unwrap()
}

pub async fn register_worker(registry: &MemoryRegistry, group: &str, address: &str) {
    let heartbeat = WorkerHeartbeat::new(address, group).to_json().unwrap();
    registry
        .put(&paths::worker_path(group, address), &heartbeat, true)
        .await
        .unwrap();
}

pub struct Cluster {
    pub registry: Arc<MemoryRegistry>,
    pub client: Arc<RecordingWorkerClient>,
    pub server: Arc<MasterServer>,
}

impl Cluster {
    /// One started master at `m1:5678` with workers `w1` and `w2` in the
    /// default group.
    pub async fn start() -> Self {
        let _ = dagger_master::init_tracing("debug");
        let registry = Arc::new(MemoryRegistry::new());
        register_worker(&registry, "default", "w1:1234").await;
        register_worker(&registry, "default", "w2:1234").await;
        let client = Arc::new(RecordingWorkerClient::default());
        let server = Arc::new(MasterServer::open(config("m1:5678"), registry.clone(), client.clone()).unwrap());
        server.start().await.unwrap();
        Self {
            registry,
            client,
            server,
        }
    }

    pub async fn succeed(&self, code: TaskCode) {
        self.succeed_with(code, ParamPool::new()).await;
    }

    pub async fn succeed_with(&self, code: TaskCode, var_pool: ParamPool) {
        let id = self.client.last_id(code);
        self.server
            .route_task_event(TaskExecutionEvent::succeeded(id, var_pool))
            .await
            .unwrap();
    }

    pub async fn fail(&self, code: TaskCode) {
        let id = self.client.last_id(code);
        self.server
            .route_task_event(TaskExecutionEvent::failed(id, "exit code 1"))
            .await
            .unwrap();
    }

    pub async fn report(&self, code: TaskCode, status: TaskStatus) {
        let id = self.client.last_id(code);
        self.server
            .route_task_event(TaskExecutionEvent::Finished {
                task_instance_id: id,
                status,
                end_time: Utc::now(),
                var_pool: ParamPool::new(),
                error: None,
            })
            .await
            .unwrap();
    }

    pub async fn running(&self, code: TaskCode) {
        let (host, request) = self.client.last(code).unwrap();
        self.server
            .route_task_event(TaskExecutionEvent::running(request.task_instance_id, host))
            .await
            .unwrap();
    }

    pub async fn wait_dispatched(&self, code: TaskCode, times: usize) {
        let client = self.client.clone();
        assert!(
            eventually(|| {
                let client = client.clone();
                async move { client.dispatch_count(code) >= times }
            })
            .await,
            "task {} was not dispatched {} time(s), saw {:?}",
            code,
            times,
            self.client.codes()
        );
    }

    pub async fn wait_status(&self, id: WorkflowInstanceId, status: WorkflowStatus) {
        wait_status(&self.server, id, status).await;
    }
}

pub async fn status_of(server: &MasterServer, id: WorkflowInstanceId) -> Option<WorkflowStatus> {
    server
        .storage()
        .get_workflow_instance(id)
        .await
        .unwrap()
        .map(|i| i.status)
}

pub async fn wait_status(server: &Arc<MasterServer>, id: WorkflowInstanceId, status: WorkflowStatus) {
    let watched = server.clone();
    let reached = eventually(|| {
        let watched = watched.clone();
        async move { status_of(&watched, id).await == Some(status) }
    })
    .await;
    assert!(
        reached,
        "workflow {} never reached {}, last seen {:?}",
        id,
        status,
        status_of(server, id).await
    );
}

/// Poll `check` for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Give in-flight events time to be processed.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
