use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Host;
use crate::model::{ParamPool, TaskCode, TaskInstanceId, WorkflowInstanceId};

/// Everything a worker needs to run one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_instance_id: TaskInstanceId,
    pub task_code: TaskCode,
    pub task_name: String,
    pub task_type: String,
    /// Parameters with placeholders already substituted
    pub params: Value,
    pub worker_group: String,
    pub retry_count: u32,
    /// Where the worker reports running/finished events
    pub master_host: String,
    pub timeout_secs: Option<u64>,
    pub var_pool: ParamPool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAck {
    pub accepted: bool,
    pub message: Option<String>,
}

impl DispatchAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: Some(message.into()),
        }
    }
}

/// Typed RPC surface of a worker. Implementations own the transport; errors
/// are transport failures.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn dispatch_task(&self, host: &Host, request: &DispatchRequest) -> anyhow::Result<DispatchAck>;

    async fn kill_task(&self, host: &str, task_instance_id: TaskInstanceId) -> anyhow::Result<()>;

    /// Ask a worker to report a still-running task to `master_host` from now
    /// on. `false` when the worker no longer knows the task.
    async fn take_over_task(
        &self,
        host: &str,
        task_instance_id: TaskInstanceId,
        master_host: &str,
    ) -> anyhow::Result<bool>;
}
