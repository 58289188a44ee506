//! Immutable per-instance task graph plus the branch overlay.

mod overlay;

pub use overlay::{BranchOverlay, EdgeState};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::core::errors::{MasterError, Result};
use crate::model::{TaskCode, TaskDefinition, WorkflowDefinition};

/// One node of the graph with its ordered neighbour lists.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub definition: TaskDefinition,
    pub predecessors: Vec<TaskCode>,
    pub successors: Vec<TaskCode>,
    /// Nodes a switch/conditions node may select, `None` for other types
    pub branch_targets: Option<Vec<TaskCode>>,
}

impl DagNode {
    pub fn code(&self) -> TaskCode {
        self.definition.code
    }

    pub fn is_branch(&self) -> bool {
        self.branch_targets.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<TaskCode, ()>,
    index: HashMap<TaskCode, NodeIndex>,
    nodes: HashMap<TaskCode, DagNode>,
    start_nodes: Vec<TaskCode>,
    topo_order: Vec<TaskCode>,
}

impl WorkflowDag {
    /// Validate a definition and build its graph.
    ///
    /// Fails on duplicate task codes, relations naming unknown nodes, cycles,
    /// malformed logic-task parameters, and branch targets that are not
    /// direct successors of their branching node.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self> {
        if definition.tasks.is_empty() {
            return Err(MasterError::validation(format!(
                "workflow definition {} has no tasks",
                definition.code
            )));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut nodes = HashMap::new();

        for task in &definition.tasks {
            if index.contains_key(&task.code) {
                return Err(MasterError::validation(format!("duplicate task code {}", task.code)));
            }
            task.validate_params()?;
            let idx = graph.add_node(task.code);
            index.insert(task.code, idx);
            nodes.insert(
                task.code,
                DagNode {
                    definition: task.clone(),
                    predecessors: Vec::new(),
                    successors: Vec::new(),
                    branch_targets: task.branch_targets()?,
                },
            );
        }

        let mut seen = HashSet::new();
        for relation in &definition.relations {
            let (Some(&from), Some(&to)) = (index.get(&relation.pre), index.get(&relation.post)) else {
                let missing = if index.contains_key(&relation.pre) {
                    relation.post
                } else {
                    relation.pre
                };
                return Err(MasterError::validation(format!(
                    "relation {} -> {} references missing node {}",
                    relation.pre, relation.post, missing
                )));
            };
            if !seen.insert((relation.pre, relation.post)) {
                debug!(pre = relation.pre, post = relation.post, "Ignoring duplicate relation");
                continue;
            }
            graph.add_edge(from, to, ());
            if let Some(node) = nodes.get_mut(&relation.pre) {
                node.successors.push(relation.post);
            }
            if let Some(node) = nodes.get_mut(&relation.post) {
                node.predecessors.push(relation.pre);
            }
        }

        let topo_order = toposort(&graph, None)
            .map_err(|cycle| {
                MasterError::validation(format!(
                    "the graph is not a DAG: cycle through node {}",
                    graph[cycle.node_id()]
                ))
            })?
            .into_iter()
            .map(|idx| graph[idx])
            .collect::<Vec<_>>();

        for node in nodes.values() {
            if let Some(targets) = &node.branch_targets {
                for target in targets {
                    if !nodes.contains_key(target) {
                        return Err(MasterError::configuration(format!(
                            "branch node {} targets unknown node {}",
                            node.code(),
                            target
                        )));
                    }
                    if !node.successors.contains(target) {
                        return Err(MasterError::configuration(format!(
                            "branch node {} targets {} which is not a direct successor",
                            node.code(),
                            target
                        )));
                    }
                }
            }
        }

        let start_nodes = definition
            .tasks
            .iter()
            .map(|t| t.code)
            .filter(|code| nodes.get(code).map_or(false, |n| n.predecessors.is_empty()))
            .collect();

        Ok(Self {
            graph,
            index,
            nodes,
            start_nodes,
            topo_order,
        })
    }

    pub fn contains_node(&self, code: TaskCode) -> bool {
        self.nodes.contains_key(&code)
    }

    pub fn node(&self, code: TaskCode) -> Result<&DagNode> {
        self.nodes
            .get(&code)
            .ok_or_else(|| MasterError::validation(format!("node {} not found", code)))
    }

    pub fn predecessors(&self, code: TaskCode) -> Result<&[TaskCode]> {
        Ok(&self.node(code)?.predecessors)
    }

    pub fn successors(&self, code: TaskCode) -> Result<&[TaskCode]> {
        Ok(&self.node(code)?.successors)
    }

    pub fn start_nodes(&self) -> &[TaskCode] {
        &self.start_nodes
    }

    pub fn is_start_node(&self, code: TaskCode) -> bool {
        self.nodes.get(&code).map_or(false, |n| n.predecessors.is_empty())
    }

    pub fn is_branch_node(&self, code: TaskCode) -> bool {
        self.nodes.get(&code).map_or(false, DagNode::is_branch)
    }

    pub fn branch_targets(&self, code: TaskCode) -> Option<&[TaskCode]> {
        self.nodes.get(&code).and_then(|n| n.branch_targets.as_deref())
    }

    /// Every node in dependency order.
    pub fn topological_order(&self) -> &[TaskCode] {
        &self.topo_order
    }

    /// All nodes reachable from `code`, excluding itself.
    pub fn descendants(&self, code: TaskCode) -> BTreeSet<TaskCode> {
        self.walk(code, |node| &node.successors)
    }

    /// All nodes `code` is reachable from, excluding itself.
    pub fn ancestors(&self, code: TaskCode) -> BTreeSet<TaskCode> {
        self.walk(code, |node| &node.predecessors)
    }

    fn walk<'a>(&'a self, code: TaskCode, next: impl Fn(&'a DagNode) -> &'a Vec<TaskCode>) -> BTreeSet<TaskCode> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([code]);
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&current) {
                for &neighbour in next(node) {
                    if found.insert(neighbour) {
                        queue.push_back(neighbour);
                    }
                }
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub(crate) fn has_edge(&self, from: TaskCode, to: TaskCode) -> bool {
        match (self.index.get(&from), self.index.get(&to)) {
            (Some(&a), Some(&b)) => self.graph.contains_edge(a, b),
            _ => false,
        }
    }
}
