//! Which nodes of a workflow may run next.
//!
//! A pure function of the DAG, the branch overlay, the status of the current
//! attempt of every node, and the blocking nodes that triggered. The runnable
//! recomputes it after every event.

use std::collections::{BTreeSet, HashMap};

use crate::dag::{BranchOverlay, EdgeState, WorkflowDag};
use crate::model::{TaskCode, TaskStatus, TriggerRule};

/// What one incoming edge contributes to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upstream {
    Satisfied,
    Unsatisfiable,
    Waiting,
    /// Edge will never carry anything: inactive branch or skipped source
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontier {
    /// Nodes without an attempt whose predecessors allow them to run, in
    /// topological order
    pub runnable: Vec<TaskCode>,
    /// Nodes without an attempt still waiting on a predecessor
    pub waiting: BTreeSet<TaskCode>,
    /// Runnable or waiting nodes held back by a triggered blocking node
    pub gated: BTreeSet<TaskCode>,
    /// Nodes cut off by branch decisions; they never run
    pub skipped: BTreeSet<TaskCode>,
    /// Nodes that can never run because a required predecessor failed
    pub dead: BTreeSet<TaskCode>,
    /// Untolerated failures no downstream conditions node absorbs
    pub failed: BTreeSet<TaskCode>,
    pub killed: BTreeSet<TaskCode>,
    pub paused: BTreeSet<TaskCode>,
    /// Attempts in SUBMITTED, DISPATCH, RUNNING or NEED_FAULT_TOLERANCE
    pub in_flight: usize,
}

impl Frontier {
    /// Compute the frontier.
    ///
    /// `statuses` holds the status of the current attempt of every node that
    /// has one. `triggered_blocks` lists blocking nodes whose verdict stopped
    /// the workflow; all their descendants are gated.
    pub fn compute(
        dag: &WorkflowDag,
        overlay: &BranchOverlay,
        statuses: &HashMap<TaskCode, TaskStatus>,
        triggered_blocks: &BTreeSet<TaskCode>,
    ) -> Self {
        let mut frontier = Frontier::default();
        let gates: BTreeSet<TaskCode> = triggered_blocks.iter().flat_map(|&b| dag.descendants(b)).collect();

        for &code in dag.topological_order() {
            let Ok(node) = dag.node(code) else { continue };

            if let Some(&status) = statuses.get(&code) {
                match status {
                    s if s.is_in_flight() => frontier.in_flight += 1,
                    TaskStatus::Pause => {
                        frontier.paused.insert(code);
                    }
                    TaskStatus::Kill => {
                        frontier.killed.insert(code);
                    }
                    TaskStatus::Failure if !node.definition.tolerate_failure => {
                        let absorbed = node.successors.iter().any(|s| {
                            dag.node(*s).map_or(false, |n| n.definition.runs_after_any_outcome())
                        });
                        if !absorbed {
                            frontier.failed.insert(code);
                        }
                    }
                    _ => {}
                }
                continue;
            }

            if dag.is_start_node(code) {
                frontier.admit(code, &gates);
                continue;
            }

            let any_outcome = node.definition.runs_after_any_outcome();
            let upstream: Vec<Upstream> = node
                .predecessors
                .iter()
                .map(|&pre| frontier.classify(dag, overlay, statuses, pre, code, any_outcome))
                .collect();

            if upstream.iter().all(|u| *u == Upstream::Skipped) {
                frontier.skipped.insert(code);
                continue;
            }
            let has = |wanted: Upstream| upstream.contains(&wanted);
            let verdict = match node.definition.trigger {
                TriggerRule::All if has(Upstream::Unsatisfiable) => Upstream::Unsatisfiable,
                TriggerRule::All if has(Upstream::Waiting) => Upstream::Waiting,
                TriggerRule::All => Upstream::Satisfied,
                TriggerRule::Any if has(Upstream::Satisfied) => Upstream::Satisfied,
                TriggerRule::Any if has(Upstream::Waiting) => Upstream::Waiting,
                TriggerRule::Any => Upstream::Unsatisfiable,
            };
            match verdict {
                Upstream::Satisfied => frontier.admit(code, &gates),
                Upstream::Waiting if gates.contains(&code) => {
                    frontier.gated.insert(code);
                }
                Upstream::Waiting => {
                    frontier.waiting.insert(code);
                }
                _ => {
                    frontier.dead.insert(code);
                }
            }
        }
        frontier
    }

    fn admit(&mut self, code: TaskCode, gates: &BTreeSet<TaskCode>) {
        if gates.contains(&code) {
            self.gated.insert(code);
        } else {
            self.runnable.push(code);
        }
    }

    fn classify(
        &self,
        dag: &WorkflowDag,
        overlay: &BranchOverlay,
        statuses: &HashMap<TaskCode, TaskStatus>,
        pre: TaskCode,
        code: TaskCode,
        any_outcome: bool,
    ) -> Upstream {
        if self.skipped.contains(&pre) {
            return Upstream::Skipped;
        }
        match overlay.edge_state(dag, pre, code) {
            EdgeState::Inactive => return Upstream::Skipped,
            EdgeState::Undecided if !self.dead.contains(&pre) => return Upstream::Waiting,
            _ => {}
        }
        if self.dead.contains(&pre) {
            return if any_outcome {
                Upstream::Satisfied
            } else {
                Upstream::Unsatisfiable
            };
        }
        let tolerated = dag.node(pre).map_or(false, |n| n.definition.tolerate_failure);
        match statuses.get(&pre) {
            Some(TaskStatus::Success) => Upstream::Satisfied,
            Some(TaskStatus::Failure) if tolerated || any_outcome => Upstream::Satisfied,
            Some(TaskStatus::Kill) if any_outcome => Upstream::Satisfied,
            Some(TaskStatus::Failure) | Some(TaskStatus::Kill) => Upstream::Unsatisfiable,
            _ => Upstream::Waiting,
        }
    }

    /// Any outcome that makes the workflow fail once it settles.
    pub fn has_failure(&self) -> bool {
        !self.failed.is_empty() || !self.killed.is_empty() || !self.dead.is_empty()
    }

    /// Nodes that will never get an attempt in this run.
    pub fn unreachable(&self) -> impl Iterator<Item = TaskCode> + '_ {
        self.skipped.iter().chain(self.dead.iter()).copied()
    }
}
