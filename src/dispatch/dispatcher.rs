use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{DispatchRequest, Host, HostManager, WorkerClient};
use crate::core::config::MasterConfig;
use crate::core::errors::{MasterError, Result};
use crate::logic::LogicTaskRegistry;
use crate::model::{TaskInstance, TaskInstanceId, TaskStatus};
use crate::storage::Persistence;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub master_host: String,
    pub send_timeout: Duration,
    pub send_attempts: u32,
    pub retry_backoff: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            master_host: config.listen_host.clone(),
            send_timeout: config.dispatch_timeout,
            send_attempts: config.dispatch_send_retries.max(1),
            retry_backoff: config.dispatch_retry_backoff,
        }
    }
}

/// Where a task ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchTarget {
    /// Logic task, executed by the caller inside this master
    Master,
    Worker(Host),
}

pub struct TaskDispatcher {
    settings: DispatchSettings,
    hosts: HostManager,
    client: Arc<dyn WorkerClient>,
    storage: Arc<dyn Persistence>,
    logic: LogicTaskRegistry,
}

impl TaskDispatcher {
    pub fn new(
        settings: DispatchSettings,
        hosts: HostManager,
        client: Arc<dyn WorkerClient>,
        storage: Arc<dyn Persistence>,
        logic: LogicTaskRegistry,
    ) -> Self {
        Self {
            settings,
            hosts,
            client,
            storage,
            logic,
        }
    }

    pub fn master_host(&self) -> &str {
        &self.settings.master_host
    }

    pub fn hosts(&self) -> &HostManager {
        &self.hosts
    }

    /// Hand `task` to its execution target.
    ///
    /// The task moves to DISPATCH with its host recorded and persisted
    /// before anything is sent. Send failures are retried on other hosts of
    /// the group up to `send_attempts` times; the last error is returned
    /// when every attempt fails.
    #[instrument(skip_all, fields(task_instance_id = task.id, task_code = task.task_code))]
    pub async fn dispatch(
        &self,
        task: &mut TaskInstance,
        request: &DispatchRequest,
        exclude: &[String],
    ) -> Result<DispatchTarget> {
        if self.logic.is_logic(&task.task_type) {
            task.host = Some(self.settings.master_host.clone());
            task.transition_to(TaskStatus::Dispatch)?;
            self.storage.save_task_instance(task).await?;
            return Ok(DispatchTarget::Master);
        }

        let mut tried: Vec<String> = exclude.to_vec();
        let mut last_error = None;
        for attempt in 1..=self.settings.send_attempts {
            let host = match self.hosts.select(&task.worker_group, &tried) {
                Ok(host) => host,
                // every alive host already failed once; go around again
                Err(_) if tried.len() > exclude.len() => self.hosts.select(&task.worker_group, exclude)?,
                Err(e) => return Err(e),
            };

            task.host = Some(host.address.clone());
            task.transition_to(TaskStatus::Dispatch)?;
            self.storage.save_task_instance(task).await?;

            match self.send(&host, request).await {
                Ok(()) => {
                    info!(host = %host.address, attempt, "Task dispatched");
                    return Ok(DispatchTarget::Worker(host));
                }
                Err(e) => {
                    warn!(host = %host.address, attempt, error = %e, "Dispatch attempt failed");
                    if !tried.contains(&host.address) {
                        tried.push(host.address.clone());
                    }
                    last_error = Some(e);
                    if attempt < self.settings.send_attempts {
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| MasterError::no_host(task.worker_group.clone())))
    }

    async fn send(&self, host: &Host, request: &DispatchRequest) -> Result<()> {
        let timeout = self.settings.send_timeout;
        match tokio::time::timeout(timeout, self.client.dispatch_task(host, request)).await {
            Err(_) => Err(MasterError::DispatchTimeout {
                host: host.address.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(MasterError::host_unreachable(&host.address, e.to_string())),
            Ok(Ok(ack)) if !ack.accepted => Err(MasterError::host_unreachable(
                &host.address,
                format!("rejected: {}", ack.message.unwrap_or_default()),
            )),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Ask the worker at `host` to kill a task.
    pub async fn kill(&self, host: &str, task_instance_id: TaskInstanceId) -> Result<()> {
        debug!(%host, task_instance_id, "Sending kill request");
        match tokio::time::timeout(self.settings.send_timeout, self.client.kill_task(host, task_instance_id)).await {
            Err(_) => Err(MasterError::DispatchTimeout {
                host: host.to_string(),
                timeout_ms: self.settings.send_timeout.as_millis() as u64,
            }),
            Ok(result) => result.map_err(|e| MasterError::host_unreachable(host, e.to_string())),
        }
    }

    /// Re-attach a task still running on `host` to this master.
    pub async fn take_over(&self, host: &str, task_instance_id: TaskInstanceId) -> Result<bool> {
        let call = self
            .client
            .take_over_task(host, task_instance_id, &self.settings.master_host);
        match tokio::time::timeout(self.settings.send_timeout, call).await {
            Err(_) => Err(MasterError::DispatchTimeout {
                host: host.to_string(),
                timeout_ms: self.settings.send_timeout.as_millis() as u64,
            }),
            Ok(result) => result.map_err(|e| MasterError::host_unreachable(host, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchAck, HostSelectorKind, WorkerDirectory};
    use crate::model::{ParamPool, TaskDefinition};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Fails every send to hosts listed in `down`.
    #[derive(Default)]
    struct FlakyClient {
        down: Vec<String>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkerClient for FlakyClient {
        async fn dispatch_task(&self, host: &Host, _request: &DispatchRequest) -> anyhow::Result<DispatchAck> {
            self.sent.lock().push(host.address.clone());
            if self.down.contains(&host.address) {
                anyhow::bail!("connection refused");
            }
            Ok(DispatchAck::accepted())
        }

        async fn kill_task(&self, _host: &str, _task_instance_id: TaskInstanceId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn take_over_task(&self, _host: &str, _id: TaskInstanceId, _master: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn dispatcher(client: Arc<FlakyClient>, storage: Arc<MemoryStorage>, hosts: &[&str]) -> TaskDispatcher {
        let directory = Arc::new(WorkerDirectory::new());
        for host in hosts {
            directory.upsert(Host::new(*host, "default"));
        }
        TaskDispatcher::new(
            DispatchSettings {
                master_host: "master:5678".into(),
                send_timeout: Duration::from_millis(200),
                send_attempts: 3,
                retry_backoff: Duration::from_millis(1),
            },
            HostManager::new(directory, HostSelectorKind::RoundRobin),
            client,
            storage,
            LogicTaskRegistry::with_defaults().unwrap(),
        )
    }

    fn request(task: &TaskInstance) -> DispatchRequest {
        DispatchRequest {
            workflow_instance_id: task.workflow_instance_id,
            task_instance_id: task.id,
            task_code: task.task_code,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            params: Value::Null,
            worker_group: task.worker_group.clone(),
            retry_count: task.retry_count,
            master_host: "master:5678".into(),
            timeout_secs: None,
            var_pool: ParamPool::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_records_host_before_send() {
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(FlakyClient::default());
        let dispatcher = dispatcher(client.clone(), storage.clone(), &["w1"]);
        let mut task = TaskInstance::new(1, 1, &TaskDefinition::new(1, "a", "SHELL"), "default");

        let req = request(&task);

        let target = dispatcher.dispatch(&mut task, &req, &[]).await.unwrap();
        assert_eq!(target, DispatchTarget::Worker(Host::new("w1", "default")));
        assert_eq!(task.status, TaskStatus::Dispatch);
        let stored = storage.get_task_instance(1).await.unwrap().unwrap();
        assert_eq!(stored.host.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_send_failure_moves_to_next_host() {
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(FlakyClient {
            down: vec!["w1".into()],
            ..Default::default()
        });
        let dispatcher = dispatcher(client.clone(), storage, &["w1", "w2"]);
        let mut task = TaskInstance::new(1, 1, &TaskDefinition::new(1, "a", "SHELL"), "default");

        let req = request(&task);

        dispatcher.dispatch(&mut task, &req, &[]).await.unwrap();
        assert_eq!(task.host.as_deref(), Some("w2"));
        assert_eq!(*client.sent.lock(), vec!["w1".to_string(), "w2".to_string()]);
    }

    #[tokio::test]
    async fn test_all_attempts_fail() {
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(FlakyClient {
            down: vec!["w1".into()],
            ..Default::default()
        });
        let dispatcher = dispatcher(client.clone(), storage, &["w1"]);
        let mut task = TaskInstance::new(1, 1, &TaskDefinition::new(1, "a", "SHELL"), "default");

        let req = request(&task);

        let err = dispatcher.dispatch(&mut task, &req, &[]).await.unwrap_err();
        assert!(err.is_dispatch_failure());
        assert_eq!(client.sent.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_no_host_is_distinct_error() {
        let storage = Arc::new(MemoryStorage::new());
        let dispatcher = dispatcher(Arc::new(FlakyClient::default()), storage, &[]);
        let mut task = TaskInstance::new(1, 1, &TaskDefinition::new(1, "a", "SHELL"), "default");

        let req = request(&task);

        let err = dispatcher.dispatch(&mut task, &req, &[]).await.unwrap_err();
        assert!(matches!(err, MasterError::NoHostAvailable { .. }));
        assert_eq!(task.status, TaskStatus::Submitted);
    }

    #[tokio::test]
    async fn test_logic_tasks_stay_on_master() {
        let storage = Arc::new(MemoryStorage::new());
        let client = Arc::new(FlakyClient::default());
        let dispatcher = dispatcher(client.clone(), storage, &["w1"]);
        let mut task = TaskInstance::new(1, 1, &TaskDefinition::new(1, "route", "SWITCH"), "default");

        let req = request(&task);

        let target = dispatcher.dispatch(&mut task, &req, &[]).await.unwrap();
        assert_eq!(target, DispatchTarget::Master);
        assert_eq!(task.host.as_deref(), Some("master:5678"));
        assert!(client.sent.lock().is_empty());
    }
}
