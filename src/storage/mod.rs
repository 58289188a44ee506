//! Persistence contract for definitions, workflow instances and task
//! instances, with in-memory and sled-backed implementations.

mod memory;
mod sled_store;

pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

use async_trait::async_trait;

use crate::core::errors::Result;
use crate::model::{
    DefinitionCode, TaskInstance, TaskInstanceId, WorkflowDefinition, WorkflowInstance, WorkflowInstanceId,
};

/// Storage trait for master state
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()>;

    async fn get_definition(&self, code: DefinitionCode, version: i32) -> Result<Option<WorkflowDefinition>>;

    async fn next_workflow_instance_id(&self) -> Result<WorkflowInstanceId>;

    async fn next_task_instance_id(&self) -> Result<TaskInstanceId>;

    async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn get_workflow_instance(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>>;

    async fn save_task_instance(&self, task: &TaskInstance) -> Result<()>;

    async fn get_task_instance(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>>;

    /// Every attempt of every node, superseded ones included
    async fn task_instances(&self, workflow_id: WorkflowInstanceId) -> Result<Vec<TaskInstance>>;

    /// Current attempt of each node
    async fn valid_task_instances(&self, workflow_id: WorkflowInstanceId) -> Result<Vec<TaskInstance>> {
        Ok(self
            .task_instances(workflow_id)
            .await?
            .into_iter()
            .filter(|t| t.valid)
            .collect())
    }

    /// Non-terminal instances owned by the master at `host`
    async fn workflow_instances_by_host(&self, host: &str) -> Result<Vec<WorkflowInstance>>;

    /// Most recent instance of a definition, any status
    async fn latest_workflow_instance(&self, definition_code: DefinitionCode) -> Result<Option<WorkflowInstance>>;

    /// Flush pending writes
    async fn flush(&self) -> Result<()>;
}
