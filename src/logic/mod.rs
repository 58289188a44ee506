//! Control-flow tasks evaluated inside the master.
//!
//! Executors are looked up by task-type string. Each one is a synchronous,
//! side-effect free function of a [`LogicTaskContext`]; the workflow runnable
//! applies the returned [`LogicResult`] to its own state.

pub mod blocking;
pub mod conditions;
pub mod dependent;
pub mod expression;
pub mod switch;

pub use dependent::{DependResult, DependencySnapshot, ExternalWorkflowState};
pub use expression::ExpressionEvaluator;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::core::errors::{MasterError, Result};
use crate::dag::WorkflowDag;
use crate::model::{DependenceTree, ParamPool, TaskCode, TaskDefinition, TaskInstance};

/// Everything a logic executor may look at
pub struct LogicTaskContext<'a> {
    pub definition: &'a TaskDefinition,
    pub task: &'a TaskInstance,
    pub dag: &'a WorkflowDag,
    /// Workflow globals overlaid with the upstream variable pool
    pub params: &'a ParamPool,
    pub snapshot: &'a DependencySnapshot,
    pub expressions: &'a ExpressionEvaluator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicStatus {
    Success,
    Failure,
    /// Not decidable yet; evaluate again on the next tick
    Waiting,
}

/// Verdict of a logic task, stored as the task's `logic_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicResult {
    pub status: LogicStatus,
    /// Successors a branching task activated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<BTreeSet<TaskCode>>,
    /// Whether a blocking task stopped the workflow
    #[serde(default)]
    pub block: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogicResult {
    pub fn success() -> Self {
        Self {
            status: LogicStatus::Success,
            selected: None,
            block: false,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: LogicStatus::Failure,
            selected: None,
            block: false,
            message: Some(message.into()),
        }
    }

    pub fn waiting() -> Self {
        Self {
            status: LogicStatus::Waiting,
            selected: None,
            block: false,
            message: None,
        }
    }

    pub fn branch(targets: impl IntoIterator<Item = TaskCode>) -> Self {
        Self {
            selected: Some(targets.into_iter().collect()),
            ..Self::success()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_state(state: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(state.clone())?)
    }
}

pub trait LogicTaskExecutor: Send + Sync {
    fn task_type(&self) -> &str;

    /// Dependency trees the executor reads, so the caller can prefetch
    /// cross-workflow state before `execute`.
    fn dependencies(&self, _definition: &TaskDefinition) -> Result<Vec<DependenceTree>> {
        Ok(Vec::new())
    }

    fn execute(&self, ctx: &LogicTaskContext<'_>) -> Result<LogicResult>;
}

/// Task-type keyed table of logic executors
#[derive(Clone)]
pub struct LogicTaskRegistry {
    executors: Arc<RwLock<HashMap<String, Arc<dyn LogicTaskExecutor>>>>,
    expressions: Arc<ExpressionEvaluator>,
}

impl std::fmt::Debug for LogicTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicTaskRegistry").field("types", &self.list()).finish()
    }
}

impl LogicTaskRegistry {
    /// Create an empty registry
    pub fn new() -> Result<Self> {
        Ok(Self {
            executors: Arc::new(RwLock::new(HashMap::new())),
            expressions: Arc::new(ExpressionEvaluator::new()?),
        })
    }

    /// Registry with SWITCH, BLOCKING, DEPENDENT and CONDITIONS
    pub fn with_defaults() -> Result<Self> {
        let registry = Self::new()?;
        registry.register(Arc::new(switch::SwitchTask));
        registry.register(Arc::new(blocking::BlockingTask));
        registry.register(Arc::new(dependent::DependentTask));
        registry.register(Arc::new(conditions::ConditionsTask));
        Ok(registry)
    }

    pub fn register(&self, executor: Arc<dyn LogicTaskExecutor>) {
        self.executors.write().insert(executor.task_type().to_string(), executor);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn LogicTaskExecutor>> {
        self.executors.read().get(task_type).cloned()
    }

    pub fn is_logic(&self, task_type: &str) -> bool {
        self.executors.read().contains_key(task_type)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn expressions(&self) -> &ExpressionEvaluator {
        &self.expressions
    }

    pub fn dependencies(&self, definition: &TaskDefinition) -> Result<Vec<DependenceTree>> {
        match self.get(&definition.task_type) {
            Some(executor) => executor.dependencies(definition),
            None => Ok(Vec::new()),
        }
    }

    pub fn execute(&self, ctx: &LogicTaskContext<'_>) -> Result<LogicResult> {
        let executor = self.get(&ctx.definition.task_type).ok_or_else(|| {
            MasterError::configuration(format!("no logic executor for task type {}", ctx.definition.task_type))
        })?;
        executor.execute(ctx)
    }
}
