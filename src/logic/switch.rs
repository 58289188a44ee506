use tracing::{debug, warn};

use super::dependent::{evaluate_tree, DependResult};
use super::{LogicResult, LogicTaskContext, LogicTaskExecutor};
use crate::core::errors::{MasterError, Result};
use crate::model::params::{self, SwitchCase, SwitchParameters};
use crate::model::{task_types, DependenceTree, TaskCode, TaskDefinition};

/// Conditional branch. Cases are tried in order and the first whose
/// condition holds selects its successors; otherwise the default branch.
pub struct SwitchTask;

impl SwitchTask {
    fn case_matches(ctx: &LogicTaskContext<'_>, index: usize, case: &SwitchCase) -> bool {
        if case.condition.is_none() && case.dependence.is_none() {
            warn!(task_code = ctx.definition.code, case = index, "Switch case has no condition, skipping");
            return false;
        }
        if let Some(condition) = &case.condition {
            match ctx.expressions.evaluate_bool(condition, ctx.params) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(
                        task_code = ctx.definition.code,
                        case = index,
                        error = %e,
                        "Switch condition failed to evaluate, treating as false"
                    );
                    return false;
                }
            }
        }
        match &case.dependence {
            Some(tree) => evaluate_tree(tree, ctx.snapshot) == DependResult::Success,
            None => true,
        }
    }
}

impl LogicTaskExecutor for SwitchTask {
    fn task_type(&self) -> &str {
        task_types::SWITCH
    }

    fn dependencies(&self, definition: &TaskDefinition) -> Result<Vec<DependenceTree>> {
        let params: SwitchParameters = params::parse(definition.code, &definition.params)?;
        Ok(params.cases.into_iter().filter_map(|c| c.dependence).collect())
    }

    fn execute(&self, ctx: &LogicTaskContext<'_>) -> Result<LogicResult> {
        let code = ctx.definition.code;
        let params: SwitchParameters = params::parse(code, &ctx.definition.params)?;

        let (selected, reason): (Vec<TaskCode>, String) = match params
            .cases
            .iter()
            .enumerate()
            .find(|(index, case)| Self::case_matches(ctx, *index, case))
        {
            Some((index, case)) => (case.next.clone(), format!("case {} matched", index)),
            None => (params.default_next.clone(), "default branch".to_string()),
        };

        if selected.is_empty() {
            return Err(MasterError::configuration_field(
                format!("switch {} selected an empty branch ({})", code, reason),
                "params.cases",
            ));
        }
        if let Some(unknown) = selected.iter().find(|target| !ctx.dag.contains_node(**target)) {
            return Err(MasterError::configuration_field(
                format!("switch {} selected unknown node {}", code, unknown),
                "params.cases",
            ));
        }

        debug!(task_code = code, selected = ?selected, %reason, "Switch decided");
        Ok(LogicResult::branch(selected).with_message(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::Fixture;
    use crate::logic::LogicStatus;
    use crate::model::{TaskDefinition, WorkflowDefinition};
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;

    fn workflow(switch_params: Value, x: Value) -> WorkflowDefinition {
        WorkflowDefinition::new(1, "switch")
            .global_param("x", x)
            .task(TaskDefinition::new(1, "route", task_types::SWITCH).with_params(switch_params))
            .task(TaskDefinition::new(2, "b", "SHELL"))
            .task(TaskDefinition::new(3, "c", "SHELL"))
            .relation(1, 2)
            .relation(1, 3)
    }

    fn standard_cases() -> Value {
        json!({
            "cases": [
                {"condition": "x > 5", "next": [2]},
                {"condition": "x <= 5", "next": [3]}
            ]
        })
    }

    #[test]
    fn test_first_true_case_wins() {
        let fixture = Fixture::new(workflow(standard_cases(), json!(3)), 1);
        let result = fixture.run().unwrap();
        assert_eq!(result.status, LogicStatus::Success);
        assert_eq!(result.selected, Some(BTreeSet::from([3])));

        let fixture = Fixture::new(workflow(standard_cases(), json!("9")), 1);
        assert_eq!(fixture.run().unwrap().selected, Some(BTreeSet::from([2])));
    }

    #[test]
    fn test_overlapping_cases_pick_first() {
        let params = json!({
            "cases": [
                {"condition": "x > 0", "next": [2]},
                {"condition": "x > 1", "next": [3]}
            ]
        });
        let fixture = Fixture::new(workflow(params, json!(3)), 1);
        assert_eq!(fixture.run().unwrap().selected, Some(BTreeSet::from([2])));
    }

    #[test]
    fn test_broken_case_is_skipped_and_default_used() {
        let params = json!({
            "cases": [{"condition": "x >", "next": [2]}],
            "default_next": [3]
        });
        let fixture = Fixture::new(workflow(params, json!(3)), 1);
        let result = fixture.run().unwrap();
        assert_eq!(result.selected, Some(BTreeSet::from([3])));
        assert_eq!(result.message.as_deref(), Some("default branch"));
    }

    #[test]
    fn test_no_match_and_no_default_is_configuration_error() {
        let params = json!({"cases": [{"condition": "x > 100", "next": [2]}]});
        let fixture = Fixture::new(workflow(params, json!(3)), 1);
        assert!(matches!(fixture.run(), Err(MasterError::Configuration { .. })));
    }

    #[test]
    fn test_upstream_var_pool_is_visible() {
        let mut fixture = Fixture::new(workflow(standard_cases(), json!(3)), 1);
        fixture.params.insert("x".to_string(), json!(42));
        assert_eq!(fixture.run().unwrap().selected, Some(BTreeSet::from([2])));
    }

    proptest! {
        #[test]
        fn prop_switch_is_deterministic(x in -50i64..50) {
            let fixture = Fixture::new(workflow(standard_cases(), json!(x)), 1);
            let first = fixture.run().unwrap();
            let second = fixture.run().unwrap();
            prop_assert_eq!(&first, &second);
            let expected = if x > 5 { 2 } else { 3 };
            prop_assert_eq!(first.selected, Some(BTreeSet::from([expected])));
        }
    }
}
