use super::dependent::{evaluate_tree, DependResult};
use super::{LogicResult, LogicTaskContext, LogicTaskExecutor};
use crate::core::errors::Result;
use crate::model::params::{self, ConditionsParameters};
use crate::model::{task_types, DependenceTree, TaskDefinition};

/// Two-way branch on a dependency verdict: `success_node` when satisfied,
/// `failed_node` otherwise. Either list may be empty.
pub struct ConditionsTask;

impl LogicTaskExecutor for ConditionsTask {
    fn task_type(&self) -> &str {
        task_types::CONDITIONS
    }

    fn dependencies(&self, definition: &TaskDefinition) -> Result<Vec<DependenceTree>> {
        let params: ConditionsParameters = params::parse(definition.code, &definition.params)?;
        Ok(vec![params.dependence])
    }

    fn execute(&self, ctx: &LogicTaskContext<'_>) -> Result<LogicResult> {
        let params: ConditionsParameters = params::parse(ctx.definition.code, &ctx.definition.params)?;
        Ok(match evaluate_tree(&params.dependence, ctx.snapshot) {
            DependResult::Success => LogicResult::branch(params.success_node).with_message("condition satisfied"),
            _ => LogicResult::branch(params.failed_node).with_message("condition not satisfied"),
        })
    }
}
