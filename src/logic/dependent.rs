//! Dependency trees: items reduced through AND/OR groups into one verdict.

use std::collections::{HashMap, HashSet};

use super::{LogicResult, LogicTaskContext, LogicTaskExecutor};
use crate::core::errors::Result;
use crate::model::params::{self, DependItem, DependenceTree, DependentParameters, DependentRelation, ExpectedStatus};
use crate::model::{task_types, DefinitionCode, TaskCode, TaskDefinition, TaskStatus, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependResult {
    Success,
    Failed,
    /// The referenced task or workflow has not finished yet
    Waiting,
}

/// Latest run of another workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalWorkflowState {
    pub status: WorkflowStatus,
    pub tasks: HashMap<TaskCode, TaskStatus>,
}

/// Point-in-time view of everything a dependency tree may reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencySnapshot {
    /// Current attempt status of each sibling node that has one
    pub local: HashMap<TaskCode, TaskStatus>,
    /// Sibling nodes that will never run in this instance
    pub unreachable: HashSet<TaskCode>,
    pub external: HashMap<DefinitionCode, ExternalWorkflowState>,
}

impl DependencySnapshot {
    pub fn with_local(mut self, code: TaskCode, status: TaskStatus) -> Self {
        self.local.insert(code, status);
        self
    }
}

fn compare(actual: TaskStatus, expected: ExpectedStatus) -> DependResult {
    if !actual.is_terminal() {
        return DependResult::Waiting;
    }
    let succeeded = actual == TaskStatus::Success;
    match (expected, succeeded) {
        (ExpectedStatus::Success, true) | (ExpectedStatus::Failure, false) => DependResult::Success,
        _ => DependResult::Failed,
    }
}

pub fn evaluate_item(item: &DependItem, snapshot: &DependencySnapshot) -> DependResult {
    match (item.definition_code, item.task_code) {
        (None, Some(code)) => {
            if let Some(status) = snapshot.local.get(&code) {
                compare(*status, item.status)
            } else if snapshot.unreachable.contains(&code) {
                DependResult::Failed
            } else {
                DependResult::Waiting
            }
        }
        (Some(definition), task) => {
            let Some(external) = snapshot.external.get(&definition) else {
                return DependResult::Waiting;
            };
            match task {
                Some(code) => match external.tasks.get(&code) {
                    Some(status) if status.is_terminal() => compare(*status, item.status),
                    // the run is over and the task never finished
                    _ if external.status.is_terminal() => DependResult::Failed,
                    _ => DependResult::Waiting,
                },
                None => match external.status {
                    WorkflowStatus::Success => compare(TaskStatus::Success, item.status),
                    WorkflowStatus::Failure | WorkflowStatus::Stop => compare(TaskStatus::Failure, item.status),
                    _ => DependResult::Waiting,
                },
            }
        }
        (None, None) => DependResult::Failed,
    }
}

/// AND: any failure fails, otherwise any wait waits. OR: any success wins,
/// otherwise any wait waits.
pub fn reduce(relation: DependentRelation, results: impl IntoIterator<Item = DependResult>) -> DependResult {
    let mut any_success = false;
    let mut any_failed = false;
    let mut any_waiting = false;
    for result in results {
        match result {
            DependResult::Success => any_success = true,
            DependResult::Failed => any_failed = true,
            DependResult::Waiting => any_waiting = true,
        }
    }
    match relation {
        DependentRelation::And if any_failed => DependResult::Failed,
        DependentRelation::And if any_waiting => DependResult::Waiting,
        DependentRelation::And => DependResult::Success,
        DependentRelation::Or if any_success => DependResult::Success,
        DependentRelation::Or if any_waiting => DependResult::Waiting,
        DependentRelation::Or => DependResult::Failed,
    }
}

pub fn evaluate_tree(tree: &DependenceTree, snapshot: &DependencySnapshot) -> DependResult {
    reduce(
        tree.relation,
        tree.groups.iter().map(|group| {
            reduce(
                group.relation,
                group.items.iter().map(|item| evaluate_item(item, snapshot)),
            )
        }),
    )
}

/// Standalone dependency check. Waits (stays running) until the tree is
/// decided.
pub struct DependentTask;

impl LogicTaskExecutor for DependentTask {
    fn task_type(&self) -> &str {
        task_types::DEPENDENT
    }

    fn dependencies(&self, definition: &TaskDefinition) -> Result<Vec<DependenceTree>> {
        let params: DependentParameters = params::parse(definition.code, &definition.params)?;
        Ok(vec![params.dependence])
    }

    fn execute(&self, ctx: &LogicTaskContext<'_>) -> Result<LogicResult> {
        let params: DependentParameters = params::parse(ctx.definition.code, &ctx.definition.params)?;
        Ok(match evaluate_tree(&params.dependence, ctx.snapshot) {
            DependResult::Success => LogicResult::success(),
            DependResult::Failed => LogicResult::failure("dependency check failed"),
            DependResult::Waiting => LogicResult::waiting(),
        })
    }
}
