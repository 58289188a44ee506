use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ParamPool, TaskInstanceId, TaskStatus};

/// Worker reports about one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskExecutionEvent {
    Running {
        task_instance_id: TaskInstanceId,
        host: String,
        start_time: DateTime<Utc>,
    },
    Finished {
        task_instance_id: TaskInstanceId,
        status: TaskStatus,
        end_time: DateTime<Utc>,
        #[serde(default)]
        var_pool: ParamPool,
        #[serde(default)]
        error: Option<String>,
    },
}

impl TaskExecutionEvent {
    pub fn task_instance_id(&self) -> TaskInstanceId {
        match self {
            Self::Running { task_instance_id, .. } | Self::Finished { task_instance_id, .. } => *task_instance_id,
        }
    }

    pub fn running(task_instance_id: TaskInstanceId, host: impl Into<String>) -> Self {
        Self::Running {
            task_instance_id,
            host: host.into(),
            start_time: Utc::now(),
        }
    }

    pub fn succeeded(task_instance_id: TaskInstanceId, var_pool: ParamPool) -> Self {
        Self::Finished {
            task_instance_id,
            status: TaskStatus::Success,
            end_time: Utc::now(),
            var_pool,
            error: None,
        }
    }

    pub fn failed(task_instance_id: TaskInstanceId, error: impl Into<String>) -> Self {
        Self::Finished {
            task_instance_id,
            status: TaskStatus::Failure,
            end_time: Utc::now(),
            var_pool: ParamPool::new(),
            error: Some(error.into()),
        }
    }
}

/// Operator commands addressed to one workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowCommand {
    Pause,
    /// Kill running tasks on their workers and wait for the reports
    Stop,
    /// Mark every active task killed and finish at once
    Kill,
    Resume,
}

/// Everything a workflow runnable reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Task(TaskExecutionEvent),
    Command(WorkflowCommand),
    /// A worker left the registry
    WorkerLost { host: String },
    Tick,
}

impl From<TaskExecutionEvent> for WorkflowEvent {
    fn from(event: TaskExecutionEvent) -> Self {
        Self::Task(event)
    }
}

impl From<WorkflowCommand> for WorkflowEvent {
    fn from(command: WorkflowCommand) -> Self {
        Self::Command(command)
    }
}
