use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::debug;

use super::Persistence;
use crate::core::errors::{MasterError, Result};
use crate::model::{
    DefinitionCode, TaskInstance, TaskInstanceId, WorkflowDefinition, WorkflowInstance, WorkflowInstanceId,
};

const ZSTD_LEVEL: i32 = 3;

/// sled-backed storage. Rows are zstd-compressed JSON keyed by big-endian ids.
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
    definitions: sled::Tree,
    workflows: sled::Tree,
    tasks: sled::Tree,
    /// `workflow id ++ task id` -> empty, for per-workflow scans
    workflow_tasks: sled::Tree,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened sled storage");
        Ok(Self {
            definitions: db.open_tree("definitions")?,
            workflows: db.open_tree("workflow_instances")?,
            tasks: db.open_tree("task_instances")?,
            workflow_tasks: db.open_tree("workflow_tasks")?,
            db,
        })
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let serialized = serde_json::to_vec(value)?;
        zstd::encode_all(&*serialized, ZSTD_LEVEL).map_err(|e| MasterError::io("zstd encode", e))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let raw = zstd::decode_all(bytes).map_err(|e| MasterError::io("zstd decode", e))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn definition_key(code: DefinitionCode, version: i32) -> Vec<u8> {
        let mut key = code.to_be_bytes().to_vec();
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn next_id(&self) -> Result<i64> {
        // sled ids start at 0
        Ok(self.db.generate_id()? as i64 + 1)
    }

    fn scan_workflows(&self, mut keep: impl FnMut(&WorkflowInstance) -> bool) -> Result<Vec<WorkflowInstance>> {
        let mut found = Vec::new();
        for entry in self.workflows.iter() {
            let (_, value) = entry?;
            let instance: WorkflowInstance = Self::decode(&value)?;
            if keep(&instance) {
                found.push(instance);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl Persistence for SledStorage {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        self.definitions.insert(
            Self::definition_key(definition.code, definition.version),
            Self::encode(definition)?,
        )?;
        Ok(())
    }

    async fn get_definition(&self, code: DefinitionCode, version: i32) -> Result<Option<WorkflowDefinition>> {
        self.definitions
            .get(Self::definition_key(code, version))?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn next_workflow_instance_id(&self) -> Result<WorkflowInstanceId> {
        self.next_id()
    }

    async fn next_task_instance_id(&self) -> Result<TaskInstanceId> {
        self.next_id()
    }

    async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> Result<()> {
        self.workflows
            .insert(instance.id.to_be_bytes(), Self::encode(instance)?)?;
        Ok(())
    }

    async fn get_workflow_instance(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>> {
        self.workflows
            .get(id.to_be_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn save_task_instance(&self, task: &TaskInstance) -> Result<()> {
        self.tasks.insert(task.id.to_be_bytes(), Self::encode(task)?)?;
        let mut index_key = task.workflow_instance_id.to_be_bytes().to_vec();
        index_key.extend_from_slice(&task.id.to_be_bytes());
        self.workflow_tasks.insert(index_key, Vec::<u8>::new())?;
        Ok(())
    }

    async fn get_task_instance(&self, id: TaskInstanceId) -> Result<Option<TaskInstance>> {
        self.tasks
            .get(id.to_be_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn task_instances(&self, workflow_id: WorkflowInstanceId) -> Result<Vec<TaskInstance>> {
        let mut tasks = Vec::new();
        for entry in self.workflow_tasks.scan_prefix(workflow_id.to_be_bytes()) {
            let (key, _) = entry?;
            let task_key = &key[8..];
            if let Some(bytes) = self.tasks.get(task_key)? {
                tasks.push(Self::decode::<TaskInstance>(&bytes)?);
            }
        }
        Ok(tasks)
    }

    async fn workflow_instances_by_host(&self, host: &str) -> Result<Vec<WorkflowInstance>> {
        self.scan_workflows(|w| w.host.as_deref() == Some(host) && !w.status.is_terminal())
    }

    async fn latest_workflow_instance(&self, definition_code: DefinitionCode) -> Result<Option<WorkflowInstance>> {
        Ok(self
            .scan_workflows(|w| w.definition_code == definition_code)?
            .into_iter()
            .max_by_key(|w| w.id))
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskDefinition, TaskStatus};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_sled_round_trip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let def = WorkflowDefinition::new(3, "persisted")
            .task(TaskDefinition::new(1, "a", "SHELL"))
            .task(TaskDefinition::new(2, "b", "SHELL"))
            .relation(1, 2);

        let (wf_id, task_id) = {
            let storage = SledStorage::open(dir.path()).unwrap();
            storage.save_definition(&def).await.unwrap();
            let wf_id = storage.next_workflow_instance_id().await.unwrap();
            let mut wf = WorkflowInstance::new(wf_id, &def);
            wf.host = Some("master-1:5678".into());
            storage.save_workflow_instance(&wf).await.unwrap();

            let mut task = TaskInstance::new(storage.next_task_instance_id().await.unwrap(), wf_id, &def.tasks[0], "default");
            task.transition_to(TaskStatus::Dispatch).unwrap();
            storage.save_task_instance(&task).await.unwrap();
            storage.flush().await.unwrap();
            (wf_id, task.id)
        };

        let storage = SledStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get_definition(3, 1).await.unwrap(), Some(def));
        let tasks = storage.valid_task_instances(wf_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task_id);
        assert_eq!(tasks[0].status, TaskStatus::Dispatch);
        assert_eq!(storage.workflow_instances_by_host("master-1:5678").await.unwrap().len(), 1);
        assert!(storage.next_task_instance_id().await.unwrap() > task_id);
    }
}
