use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::Persistence;
use crate::core::errors::Result;
use crate::model::{
    DefinitionCode, TaskInstance, TaskInstanceId, WorkflowDefinition, WorkflowInstance, WorkflowInstanceId,
};

/// Process-local storage, used by tests and single-node setups.
#[derive(Debug)]
pub struct MemoryStorage {
    definitions: DashMap<(DefinitionCode, i32), WorkflowDefinition>,
    workflows: DashMap<WorkflowInstanceId, WorkflowInstance>,
    tasks: DashMap<TaskInstanceId, TaskInstance>,
    next_workflow_id: AtomicI64,
    next_task_id: AtomicI64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::new(),
            workflows: DashMap::new(),
            tasks: DashMap::new(),
            next_workflow_id: AtomicI64::new(1),
            next_task_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl Persistence for MemoryStorage {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.definitions
            .insert((definition.code, definition.version), definition.clone());
        Ok(())
    }

    async fn get_definition(&self, code: DefinitionCode, version: i32) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.get(&(code, version)).map(|d| d.clone()))
    }

    async fn next_workflow_instance_id(&self) -> Result<WorkflowInstanceId> {
        Ok(self.next_workflow_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn next_task_instance_id(&self) -> Result<TaskInstanceId> {
        Ok(self.next_task_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        self.workflows.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_workflow_instance(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn save_task_instance(&self, task: &TaskInstance) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task_instance(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn task_instances(&self, workflow_id: WorkflowInstanceId) -> Result<Vec<TaskInstance>> {
        let mut tasks: Vec<TaskInstance> = self
            .tasks
            .iter()
            .filter(|t| t.workflow_instance_id == workflow_id)
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn workflow_instances_by_host(&self, host: &str) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<WorkflowInstance> = self
            .workflows
            .iter()
            .filter(|w| w.host.as_deref() == Some(host) && !w.status.is_terminal())
            .map(|w| w.clone())
            .collect();
        instances.sort_by_key(|w| w.id);
        Ok(instances)
    }

    async fn latest_workflow_instance(&self, definition_code: DefinitionCode) -> Result<Option<WorkflowInstance>> {
        Ok(self
            .workflows
            .iter()
            .filter(|w| w.definition_code == definition_code)
            .max_by_key(|w| w.id)
            .map(|w| w.clone()))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskDefinition, WorkflowStatus};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_instances_round_trip() {
        let storage = MemoryStorage::new();
        let def = WorkflowDefinition::new(9, "wf").task(TaskDefinition::new(1, "a", "SHELL"));
        storage.save_definition(&def).await.unwrap();
        assert_eq!(storage.get_definition(9, 1).await.unwrap(), Some(def.clone()));

        let id = storage.next_workflow_instance_id().await.unwrap();
        let mut wf = WorkflowInstance::new(id, &def);
        wf.host = Some("m1".into());
        storage.save_workflow_instance(&wf).await.unwrap();

        let t1 = TaskInstance::new(storage.next_task_instance_id().await.unwrap(), id, &def.tasks[0], "default");
        let mut superseded = t1.clone();
        superseded.valid = false;
        storage.save_task_instance(&superseded).await.unwrap();
        let t2 = t1.next_attempt(storage.next_task_instance_id().await.unwrap(), None);
        storage.save_task_instance(&t2).await.unwrap();

        assert_eq!(storage.task_instances(id).await.unwrap().len(), 2);
        let valid = storage.valid_task_instances(id).await.unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].id, t2.id);

        assert_eq!(storage.workflow_instances_by_host("m1").await.unwrap().len(), 1);
        wf.status = WorkflowStatus::Success;
        storage.save_workflow_instance(&wf).await.unwrap();
        assert!(storage.workflow_instances_by_host("m1").await.unwrap().is_empty());
        assert_eq!(storage.latest_workflow_instance(9).await.unwrap().map(|w| w.id), Some(id));
    }
}
