use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::params::{self, BlockingParameters, ConditionsParameters, DependentParameters, SwitchParameters};
use super::{task_types, DefinitionCode, ParamPool, TaskCode};
use crate::core::errors::Result;

/// How many predecessors must succeed before a node may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerRule {
    #[default]
    All,
    Any,
}

/// What happens to the rest of the workflow after an untolerated failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    /// Submit nothing new, let in-flight tasks finish, then fail
    #[default]
    End,
    /// Keep running every branch the failure does not feed into
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub code: TaskCode,
    pub name: String,
    pub task_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub worker_group: Option<String>,
    #[serde(default)]
    pub max_retry_times: u32,
    /// Fixed delay between attempts; engine default strategy when unset
    #[serde(default)]
    pub retry_interval_ms: Option<u64>,
    #[serde(default)]
    pub trigger: TriggerRule,
    #[serde(default)]
    pub tolerate_failure: bool,
    /// Execution timeout forwarded to the worker
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskDefinition {
    pub fn new(code: TaskCode, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            task_type: task_type.into(),
            params: Value::Null,
            worker_group: None,
            max_retry_times: 0,
            retry_interval_ms: None,
            trigger: TriggerRule::All,
            tolerate_failure: false,
            timeout_secs: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_retries(mut self, max_retry_times: u32, retry_interval_ms: Option<u64>) -> Self {
        self.max_retry_times = max_retry_times;
        self.retry_interval_ms = retry_interval_ms;
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = Some(group.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerRule) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn tolerating_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// Conditions and blocking nodes inspect how their predecessors ended, so
    /// they run after any terminal outcome and absorb upstream failures.
    pub fn runs_after_any_outcome(&self) -> bool {
        matches!(self.task_type.as_str(), task_types::CONDITIONS | task_types::BLOCKING)
    }

    /// Nodes this task may activate when it is a branching task; `None` for
    /// every other task type.
    pub fn branch_targets(&self) -> Result<Option<Vec<TaskCode>>> {
        match self.task_type.as_str() {
            task_types::SWITCH => {
                let switch: SwitchParameters = params::parse(self.code, &self.params)?;
                Ok(Some(switch.all_targets()))
            }
            task_types::CONDITIONS => {
                let conditions: ConditionsParameters = params::parse(self.code, &self.params)?;
                let mut targets: Vec<TaskCode> = conditions
                    .success_node
                    .iter()
                    .chain(conditions.failed_node.iter())
                    .copied()
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                Ok(Some(targets))
            }
            _ => Ok(None),
        }
    }

    /// Parse and check the parameter blob of logic tasks.
    pub fn validate_params(&self) -> Result<()> {
        match self.task_type.as_str() {
            task_types::SWITCH => {
                let switch: SwitchParameters = params::parse(self.code, &self.params)?;
                for case in &switch.cases {
                    if let Some(tree) = &case.dependence {
                        tree.validate(self.code)?;
                    }
                }
            }
            task_types::BLOCKING => {
                let blocking: BlockingParameters = params::parse(self.code, &self.params)?;
                blocking.dependence.validate(self.code)?;
            }
            task_types::DEPENDENT => {
                let dependent: DependentParameters = params::parse(self.code, &self.params)?;
                dependent.dependence.validate(self.code)?;
            }
            task_types::CONDITIONS => {
                let conditions: ConditionsParameters = params::parse(self.code, &self.params)?;
                conditions.dependence.validate(self.code)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Directed dependency edge `pre -> post`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRelation {
    pub pre: TaskCode,
    pub post: TaskCode,
}

impl TaskRelation {
    pub fn new(pre: TaskCode, post: TaskCode) -> Self {
        Self { pre, post }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: DefinitionCode,
    #[serde(default = "default_version")]
    pub version: i32,
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub relations: Vec<TaskRelation>,
    #[serde(default)]
    pub global_params: ParamPool,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
}

fn default_version() -> i32 {
    1
}

impl WorkflowDefinition {
    pub fn new(code: DefinitionCode, name: impl Into<String>) -> Self {
        Self {
            code,
            version: 1,
            name: name.into(),
            tasks: Vec::new(),
            relations: Vec::new(),
            global_params: ParamPool::new(),
            failure_strategy: FailureStrategy::End,
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn relation(mut self, pre: TaskCode, post: TaskCode) -> Self {
        self.relations.push(TaskRelation::new(pre, post));
        self
    }

    pub fn global_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.global_params.insert(name.into(), value);
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }
}
