use std::collections::{BTreeMap, BTreeSet};

use super::WorkflowDag;
use crate::model::TaskCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Active,
    Inactive,
    /// The branch node feeding this edge has not decided yet
    Undecided,
}

/// Per-instance record of which successors each branching node selected.
/// The DAG itself never changes; only this overlay does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchOverlay {
    selected: BTreeMap<TaskCode, BTreeSet<TaskCode>>,
}

impl BranchOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the decision of `branch`. A later call for the same node is
    /// ignored so replays cannot flip a decision.
    pub fn select(&mut self, branch: TaskCode, targets: impl IntoIterator<Item = TaskCode>) -> bool {
        if self.selected.contains_key(&branch) {
            return false;
        }
        self.selected.insert(branch, targets.into_iter().collect());
        true
    }

    pub fn is_decided(&self, branch: TaskCode) -> bool {
        self.selected.contains_key(&branch)
    }

    pub fn selected(&self, branch: TaskCode) -> Option<&BTreeSet<TaskCode>> {
        self.selected.get(&branch)
    }

    pub fn edge_state(&self, dag: &WorkflowDag, from: TaskCode, to: TaskCode) -> EdgeState {
        if !dag.is_branch_node(from) {
            return EdgeState::Active;
        }
        match self.selected.get(&from) {
            Some(targets) if targets.contains(&to) => EdgeState::Active,
            Some(_) => EdgeState::Inactive,
            None => EdgeState::Undecided,
        }
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }
}
