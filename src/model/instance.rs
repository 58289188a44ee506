use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::{FailureStrategy, TaskDefinition, WorkflowDefinition};
use super::status::{TaskStatus, Transition, WorkflowStatus};
use super::{DefinitionCode, ParamPool, TaskCode, TaskInstanceId, WorkflowInstanceId};
use crate::core::errors::{MasterError, Result};

/// One run of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub definition_code: DefinitionCode,
    pub definition_version: i32,
    pub name: String,
    pub status: WorkflowStatus,
    /// Set by a triggered blocking task, cleared on resume
    pub blocked: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_times: u32,
    /// Address of the owning master
    pub host: Option<String>,
    pub global_params: ParamPool,
    pub var_pool: ParamPool,
    pub failure_strategy: FailureStrategy,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(id: WorkflowInstanceId, definition: &WorkflowDefinition) -> Self {
        Self {
            id,
            definition_code: definition.code,
            definition_version: definition.version,
            name: format!("{}-{}", definition.name, id),
            status: WorkflowStatus::Submitted,
            blocked: false,
            start_time: None,
            end_time: None,
            run_times: 0,
            host: None,
            global_params: definition.global_params.clone(),
            var_pool: ParamPool::new(),
            failure_strategy: definition.failure_strategy,
            updated_at: Utc::now(),
        }
    }

    pub fn transition_to(&mut self, next: WorkflowStatus) -> Result<Transition> {
        if self.status == next || self.status.is_terminal() {
            return Ok(Transition::Ignored);
        }
        if !self.status.can_transition_to(next) {
            return Err(MasterError::invalid_transition("workflow", self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_finished() {
            self.end_time = Some(self.updated_at);
        } else if next == WorkflowStatus::Running {
            self.end_time = None;
        }
        Ok(Transition::Applied)
    }
}

/// One attempt of one DAG node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_code: TaskCode,
    pub name: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// False once superseded by a retry attempt
    pub valid: bool,
    pub host: Option<String>,
    pub worker_group: String,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Earliest dispatch time of a delayed retry
    pub delay_until: Option<DateTime<Utc>>,
    pub var_pool: ParamPool,
    /// Result blob of logic tasks (selected branch, blocking verdict)
    pub logic_state: Option<Value>,
    pub error: Option<String>,
}

impl TaskInstance {
    pub fn new(
        id: TaskInstanceId,
        workflow_instance_id: WorkflowInstanceId,
        definition: &TaskDefinition,
        worker_group: impl Into<String>,
    ) -> Self {
        Self {
            id,
            workflow_instance_id,
            task_code: definition.code,
            name: definition.name.clone(),
            task_type: definition.task_type.clone(),
            status: TaskStatus::Submitted,
            retry_count: 0,
            valid: true,
            host: None,
            worker_group: worker_group.into(),
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            delay_until: None,
            var_pool: ParamPool::new(),
            logic_state: None,
            error: None,
        }
    }

    /// Next attempt after a failure of `self`.
    pub fn next_attempt(&self, id: TaskInstanceId, delay_until: Option<DateTime<Utc>>) -> Self {
        Self {
            id,
            status: TaskStatus::Submitted,
            retry_count: self.retry_count + 1,
            valid: true,
            host: None,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            delay_until,
            var_pool: ParamPool::new(),
            logic_state: None,
            error: None,
            ..self.clone()
        }
    }

    /// Apply a status change. Terminal attempts and repeated statuses are
    /// left untouched.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<Transition> {
        if self.status == next || self.status.is_terminal() {
            return Ok(Transition::Ignored);
        }
        if !self.status.can_transition_to(next) {
            return Err(MasterError::invalid_transition("task", self.status, next));
        }
        self.status = next;
        match next {
            TaskStatus::Running => {
                if self.start_time.is_none() {
                    self.start_time = Some(Utc::now());
                }
            }
            TaskStatus::Submitted => {
                self.end_time = None;
            }
            s if s.is_terminal() || s == TaskStatus::Pause => {
                self.end_time = Some(Utc::now());
            }
            _ => {}
        }
        Ok(Transition::Applied)
    }

    pub fn is_ready_to_dispatch(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Submitted && self.delay_until.map_or(true, |t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::definition::TaskDefinition;

    fn task() -> TaskInstance {
        TaskInstance::new(10, 1, &TaskDefinition::new(3, "load", "SHELL"), "default")
    }

    #[test]
    fn test_task_lifecycle() {
        let mut t = task();
        assert_eq!(t.transition_to(TaskStatus::Dispatch).unwrap(), Transition::Applied);
        assert_eq!(t.transition_to(TaskStatus::Running).unwrap(), Transition::Applied);
        assert!(t.start_time.is_some());
        assert_eq!(t.transition_to(TaskStatus::Success).unwrap(), Transition::Applied);
        assert!(t.end_time.is_some());
    }

    #[test]
    fn test_terminal_transition_is_noop() {
        let mut t = task();
        t.transition_to(TaskStatus::Dispatch).unwrap();
        t.transition_to(TaskStatus::Success).unwrap();
        let end = t.end_time;
        assert_eq!(t.transition_to(TaskStatus::Failure).unwrap(), Transition::Ignored);
        assert_eq!(t.transition_to(TaskStatus::Success).unwrap(), Transition::Ignored);
        assert_eq!(t.status, TaskStatus::Success);
        assert_eq!(t.end_time, end);
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut t = task();
        t.transition_to(TaskStatus::Dispatch).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.transition_to(TaskStatus::Submitted).is_err());
        assert_eq!(t.status, TaskStatus::Running);
    }

    #[test]
    fn test_next_attempt() {
        let mut t = task();
        t.transition_to(TaskStatus::Failure).unwrap();
        let retry = t.next_attempt(11, None);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, TaskStatus::Submitted);
        assert_eq!(retry.task_code, t.task_code);
        assert!(retry.valid);
        assert!(retry.is_ready_to_dispatch(Utc::now()));
    }

    #[test]
    fn test_workflow_end_time_on_finish() {
        let def = WorkflowDefinition::new(1, "wf");
        let mut wf = WorkflowInstance::new(5, &def);
        wf.transition_to(WorkflowStatus::Running).unwrap();
        assert!(wf.end_time.is_none());
        wf.transition_to(WorkflowStatus::Success).unwrap();
        assert!(wf.end_time.is_some());
        assert_eq!(wf.transition_to(WorkflowStatus::Failure).unwrap(), Transition::Ignored);
    }
}
