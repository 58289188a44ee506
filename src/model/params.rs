//! Typed views over the parameter blobs of logic tasks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DefinitionCode, TaskCode};
use crate::core::errors::{MasterError, Result};

/// Parse a task parameter blob into one of the typed parameter structs.
pub fn parse<T: serde::de::DeserializeOwned>(task_code: TaskCode, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone()).map_err(|e| {
        MasterError::configuration_field(
            format!("task {} has malformed parameters: {}", task_code, e),
            "params",
        )
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependentRelation {
    And,
    Or,
}

impl Default for DependentRelation {
    fn default() -> Self {
        Self::And
    }
}

/// Terminal status a dependency item waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedStatus {
    Success,
    Failure,
}

impl Default for ExpectedStatus {
    fn default() -> Self {
        Self::Success
    }
}

/// One dependency: a sibling task, or a task/whole run of another workflow
/// definition when `definition_code` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependItem {
    #[serde(default)]
    pub definition_code: Option<DefinitionCode>,
    #[serde(default)]
    pub task_code: Option<TaskCode>,
    #[serde(default)]
    pub status: ExpectedStatus,
}

impl DependItem {
    pub fn task(task_code: TaskCode, status: ExpectedStatus) -> Self {
        Self {
            definition_code: None,
            task_code: Some(task_code),
            status,
        }
    }

    pub fn workflow(definition_code: DefinitionCode, status: ExpectedStatus) -> Self {
        Self {
            definition_code: Some(definition_code),
            task_code: None,
            status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependTaskGroup {
    #[serde(default)]
    pub relation: DependentRelation,
    pub items: Vec<DependItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependenceTree {
    #[serde(default)]
    pub relation: DependentRelation,
    pub groups: Vec<DependTaskGroup>,
}

impl DependenceTree {
    pub fn validate(&self, task_code: TaskCode) -> Result<()> {
        if self.groups.is_empty() {
            return Err(MasterError::configuration_field(
                format!("task {} has no dependency groups", task_code),
                "dependence",
            ));
        }
        for group in &self.groups {
            if group.items.is_empty() {
                return Err(MasterError::configuration_field(
                    format!("task {} has an empty dependency group", task_code),
                    "dependence.groups",
                ));
            }
            for item in &group.items {
                if item.definition_code.is_none() && item.task_code.is_none() {
                    return Err(MasterError::configuration_field(
                        format!("task {} has a dependency item naming neither task nor workflow", task_code),
                        "dependence.items",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Sibling task codes referenced by the tree.
    pub fn local_task_codes(&self) -> impl Iterator<Item = TaskCode> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.items.iter())
            .filter(|item| item.definition_code.is_none())
            .filter_map(|item| item.task_code)
    }

    /// Other workflow definitions referenced by the tree.
    pub fn external_definitions(&self) -> impl Iterator<Item = DefinitionCode> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.items.iter())
            .filter_map(|item| item.definition_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentParameters {
    pub dependence: DependenceTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingCondition {
    BlockingOnSuccess,
    #[serde(alias = "BLOCKING_ON_FAILURE")]
    BlockingOnFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingParameters {
    pub dependence: DependenceTree,
    pub blocking_condition: BlockingCondition,
    #[serde(default)]
    pub alert_when_blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionsParameters {
    pub dependence: DependenceTree,
    #[serde(default)]
    pub success_node: Vec<TaskCode>,
    #[serde(default)]
    pub failed_node: Vec<TaskCode>,
}

/// A switch candidate. An expression, a dependence tree, or both (all must
/// hold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub dependence: Option<DependenceTree>,
    pub next: Vec<TaskCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchParameters {
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
    #[serde(default)]
    pub default_next: Vec<TaskCode>,
}

impl SwitchParameters {
    /// Every node any case or the default may select.
    pub fn all_targets(&self) -> Vec<TaskCode> {
        let mut targets: Vec<TaskCode> = self
            .cases
            .iter()
            .flat_map(|c| c.next.iter().copied())
            .chain(self.default_next.iter().copied())
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_switch() {
        let params: SwitchParameters = parse(
            7,
            &json!({
                "cases": [
                    {"condition": "x > 5", "next": [2]},
                    {"condition": "x <= 5", "next": [3]}
                ],
                "default_next": [3]
            }),
        )
        .unwrap();
        assert_eq!(params.cases.len(), 2);
        assert_eq!(params.all_targets(), vec![2, 3]);
    }

    #[test]
    fn test_parse_blocking() {
        let params: BlockingParameters = parse(
            4,
            &json!({
                "dependence": {
                    "relation": "AND",
                    "groups": [{"relation": "OR", "items": [{"task_code": 1, "status": "FAILURE"}]}]
                },
                "blocking_condition": "BLOCKING_ON_FAILED"
            }),
        )
        .unwrap();
        assert_eq!(params.blocking_condition, BlockingCondition::BlockingOnFailed);
        assert_eq!(params.dependence.groups[0].relation, DependentRelation::Or);
        assert_eq!(params.dependence.groups[0].items[0].status, ExpectedStatus::Failure);
        assert!(params.dependence.validate(4).is_ok());
    }

    #[test]
    fn test_blocking_on_failure_spelling() {
        let params: BlockingParameters = parse(
            4,
            &json!({
                "dependence": {"groups": [{"items": [{"task_code": 1}]}]},
                "blocking_condition": "BLOCKING_ON_FAILURE"
            }),
        )
        .unwrap();
        assert_eq!(params.blocking_condition, BlockingCondition::BlockingOnFailed);
        // written back under the canonical name
        assert_eq!(
            serde_json::to_value(params.blocking_condition).unwrap(),
            json!("BLOCKING_ON_FAILED")
        );
    }

    #[test]
    fn test_malformed_params_are_configuration_errors() {
        let err = parse::<BlockingParameters>(9, &json!({"dependence": 3})).unwrap_err();
        assert!(matches!(err, MasterError::Configuration { .. }));
    }

    #[test]
    fn test_dependence_validation() {
        let empty = DependenceTree {
            relation: DependentRelation::And,
            groups: vec![],
        };
        assert!(empty.validate(1).is_err());

        let nameless = DependenceTree {
            relation: DependentRelation::And,
            groups: vec![DependTaskGroup {
                relation: DependentRelation::And,
                items: vec![DependItem {
                    definition_code: None,
                    task_code: None,
                    status: ExpectedStatus::Success,
                }],
            }],
        };
        assert!(nameless.validate(1).is_err());
    }
}
