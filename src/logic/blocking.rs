use tracing::info;

use super::dependent::{evaluate_tree, DependResult};
use super::{LogicResult, LogicTaskContext, LogicTaskExecutor};
use crate::core::errors::Result;
use crate::model::params::{self, BlockingCondition, BlockingParameters};
use crate::model::{task_types, DependenceTree, TaskDefinition};

/// Gate that blocks the workflow when its dependency verdict matches the
/// configured condition. An undecided verdict counts as unsatisfied.
pub struct BlockingTask;

impl LogicTaskExecutor for BlockingTask {
    fn task_type(&self) -> &str {
        task_types::BLOCKING
    }

    fn dependencies(&self, definition: &TaskDefinition) -> Result<Vec<DependenceTree>> {
        let params: BlockingParameters = params::parse(definition.code, &definition.params)?;
        Ok(vec![params.dependence])
    }

    fn execute(&self, ctx: &LogicTaskContext<'_>) -> Result<LogicResult> {
        let params: BlockingParameters = params::parse(ctx.definition.code, &ctx.definition.params)?;
        let satisfied = evaluate_tree(&params.dependence, ctx.snapshot) == DependResult::Success;
        let block = match params.blocking_condition {
            BlockingCondition::BlockingOnSuccess => satisfied,
            BlockingCondition::BlockingOnFailed => !satisfied,
        };

        if block {
            info!(
                task_code = ctx.definition.code,
                workflow_instance_id = ctx.task.workflow_instance_id,
                alert = params.alert_when_blocking,
                "Blocking condition met, workflow will block"
            );
        }

        Ok(LogicResult {
            block,
            ..LogicResult::success().with_message(if satisfied {
                "dependencies satisfied"
            } else {
                "dependencies not satisfied"
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::Fixture;
    use crate::logic::LogicStatus;
    use crate::model::{TaskStatus, WorkflowDefinition};
    use serde_json::json;

    fn workflow(condition: &str, expected: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(1, "blocking")
            .task(TaskDefinition::new(1, "a", "SHELL"))
            .task(TaskDefinition::new(2, "gate", task_types::BLOCKING).with_params(json!({
                "dependence": {"groups": [{"items": [{"task_code": 1, "status": expected}]}]},
                "blocking_condition": condition
            })))
            .task(TaskDefinition::new(3, "after", "SHELL"))
            .relation(1, 2)
            .relation(2, 3)
    }

    #[test]
    fn test_block_on_failed_when_dependency_failed() {
        let mut fixture = Fixture::new(workflow("BLOCKING_ON_FAILED", "SUCCESS"), 2);
        fixture.snapshot.local.insert(1, TaskStatus::Failure);
        let result = fixture.run().unwrap();
        assert_eq!(result.status, LogicStatus::Success);
        assert!(result.block);
    }

    #[test]
    fn test_no_block_on_failed_when_dependency_succeeded() {
        let mut fixture = Fixture::new(workflow("BLOCKING_ON_FAILED", "SUCCESS"), 2);
        fixture.snapshot.local.insert(1, TaskStatus::Success);
        assert!(!fixture.run().unwrap().block);
    }

    #[test]
    fn test_block_on_success() {
        let mut fixture = Fixture::new(workflow("BLOCKING_ON_SUCCESS", "SUCCESS"), 2);
        fixture.snapshot.local.insert(1, TaskStatus::Success);
        assert!(fixture.run().unwrap().block);
    }

    #[test]
    fn test_waiting_counts_as_unsatisfied() {
        let fixture = Fixture::new(workflow("BLOCKING_ON_FAILED", "SUCCESS"), 2);
        assert!(fixture.run().unwrap().block);
        let fixture = Fixture::new(workflow("BLOCKING_ON_SUCCESS", "SUCCESS"), 2);
        assert!(!fixture.run().unwrap().block);
    }
}
