//! Process-wide ownership map: workflow instance id -> the inbox of its single
//! runnable, plus the task-instance routes used to deliver worker events.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::core::errors::{MasterError, Result};
use crate::engine::WorkflowEvent;
use crate::model::{TaskInstanceId, WorkflowInstanceId};

/// Address of a live runnable. The cache owns these; runnables never hold
/// a reference back into the cache.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    pub workflow_instance_id: WorkflowInstanceId,
    sender: mpsc::Sender<WorkflowEvent>,
}

impl WorkflowHandle {
    pub fn new(workflow_instance_id: WorkflowInstanceId, sender: mpsc::Sender<WorkflowEvent>) -> Self {
        Self {
            workflow_instance_id,
            sender,
        }
    }

    pub async fn send(&self, event: impl Into<WorkflowEvent>) -> Result<()> {
        self.sender.send(event.into()).await.map_err(|_| self.closed())
    }

    /// Hand `event` over without waiting on the runnable. When the inbox is
    /// full the event is parked on a forwarding task; its order relative to
    /// later events is then not kept.
    pub fn deliver(&self, event: impl Into<WorkflowEvent>) -> Result<()> {
        match self.sender.try_send(event.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(self.closed()),
            Err(TrySendError::Full(event)) => {
                warn!(
                    workflow_instance_id = self.workflow_instance_id,
                    "Runnable inbox full, forwarding in background"
                );
                let sender = self.sender.clone();
                let id = self.workflow_instance_id;
                tokio::spawn(async move {
                    if sender.send(event).await.is_err() {
                        debug!(workflow_instance_id = id, "Runnable exited before forwarded event");
                    }
                });
                Ok(())
            }
        }
    }

    fn closed(&self) -> MasterError {
        MasterError::channel(
            format!("workflow-{}", self.workflow_instance_id),
            "runnable inbox closed",
        )
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct InstanceCache {
    entries: DashMap<WorkflowInstanceId, WorkflowHandle>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single owner of an instance. A second insert for the
    /// same id fails, whoever wins the race keeps the instance.
    pub fn insert(&self, handle: WorkflowHandle) -> Result<()> {
        match self.entries.entry(handle.workflow_instance_id) {
            Entry::Occupied(_) => Err(MasterError::DuplicateInstance(handle.workflow_instance_id)),
            Entry::Vacant(slot) => {
                debug!(workflow_instance_id = handle.workflow_instance_id, "Runnable cached");
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: WorkflowInstanceId) -> Option<WorkflowHandle> {
        self.entries.get(&id).map(|h| h.clone())
    }

    pub fn remove(&self, id: WorkflowInstanceId) -> Option<WorkflowHandle> {
        self.entries.remove(&id).map(|(_, handle)| handle)
    }

    /// Drop the entry only if its runnable has exited, so a fresh owner
    /// registered in the meantime survives.
    pub fn remove_if_closed(&self, id: WorkflowInstanceId) -> bool {
        self.entries.remove_if(&id, |_, handle| handle.is_closed()).is_some()
    }

    /// Forget every runnable. Dropping the inboxes makes each runnable exit
    /// after its current event.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn contains(&self, id: WorkflowInstanceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkflowInstanceId> {
        let mut ids: Vec<WorkflowInstanceId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Deliver `event` to every cached runnable; returns how many accepted it.
    pub fn broadcast(&self, event: WorkflowEvent) -> usize {
        let handles: Vec<WorkflowHandle> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut delivered = 0;
        for handle in handles {
            match handle.deliver(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(workflow_instance_id = handle.workflow_instance_id, error = %e, "Broadcast skipped"),
            }
        }
        delivered
    }
}

/// Task instance id -> owning workflow instance.
#[derive(Debug, Default)]
pub struct TaskRouteTable {
    routes: DashMap<TaskInstanceId, WorkflowInstanceId>,
}

impl TaskRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_instance_id: TaskInstanceId, workflow_instance_id: WorkflowInstanceId) {
        self.routes.insert(task_instance_id, workflow_instance_id);
    }

    pub fn lookup(&self, task_instance_id: TaskInstanceId) -> Option<WorkflowInstanceId> {
        self.routes.get(&task_instance_id).map(|r| *r)
    }

    pub fn remove_workflow(&self, workflow_instance_id: WorkflowInstanceId) {
        self.routes.retain(|_, owner| *owner != workflow_instance_id);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
