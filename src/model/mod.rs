//! Persistent data model: definitions, instances and their status machines.

pub mod definition;
pub mod instance;
pub mod params;
pub mod status;

use serde_json::Value;
use std::collections::BTreeMap;

pub use definition::{FailureStrategy, TaskDefinition, TaskRelation, TriggerRule, WorkflowDefinition};
pub use instance::{TaskInstance, WorkflowInstance};
pub use params::{
    BlockingCondition, BlockingParameters, ConditionsParameters, DependItem, DependTaskGroup,
    DependenceTree, DependentParameters, DependentRelation, ExpectedStatus, SwitchCase,
    SwitchParameters,
};
pub use status::{TaskStatus, Transition, WorkflowStatus};

pub type WorkflowInstanceId = i64;
pub type TaskInstanceId = i64;
pub type TaskCode = i64;
pub type DefinitionCode = i64;

/// Named parameter values. Ordered so that merges and substitutions are
/// deterministic.
pub type ParamPool = BTreeMap<String, Value>;

/// Task type names handled inside the master.
pub mod task_types {
    pub const SWITCH: &str = "SWITCH";
    pub const BLOCKING: &str = "BLOCKING";
    pub const DEPENDENT: &str = "DEPENDENT";
    pub const CONDITIONS: &str = "CONDITIONS";
}
