//! Task tree arena.
//!
//! Nodes are stored flat by id; parent/child/dependency links are ids, never
//! owned references. The scheduling loop is the only writer.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::node::{NodeFailure, NodeId, NodeKind, NodeOutcome, NodeState, TaskNode, TaskOutput};
use super::plan::Plan;

/// The tree of nodes for one run.
#[derive(Debug, Clone)]
pub struct TaskTree {
    nodes: HashMap<NodeId, TaskNode>,
    root_id: Option<NodeId>,
    max_depth: u32,
}

impl TaskTree {
    /// Create an empty tree. Nodes deeper than `max_depth` are refused.
    pub fn new(max_depth: u32) -> Self {
        Self {
            nodes: HashMap::new(),
            root_id: None,
            max_depth,
        }
    }

    /// Insert the root node.
    pub fn insert_root(&mut self, goal: impl Into<String>) -> Result<NodeId, TreeError> {
        if self.root_id.is_some() {
            return Err(TreeError::RootAlreadyExists);
        }
        let node = TaskNode::root(goal);
        let id = node.id();
        self.nodes.insert(id, node);
        self.root_id = Some(id);
        Ok(id)
    }

    /// Materialize a plan as children of `parent_id`.
    ///
    /// Returns the new ids in plan order.
    pub fn add_children(&mut self, parent_id: NodeId, plan: &Plan) -> Result<Vec<NodeId>, TreeError> {
        let parent = self.get(parent_id).ok_or(TreeError::NodeNotFound(parent_id))?;
        if parent.kind() != NodeKind::Composite {
            return Err(TreeError::NotComposite(parent_id));
        }
        if !parent.children().is_empty() {
            return Err(TreeError::ChildrenAlreadySet(parent_id));
        }
        if parent.depth() >= self.max_depth {
            return Err(TreeError::DepthLimit {
                depth: parent.depth() + 1,
                max: self.max_depth,
            });
        }

        let mut ids: Vec<NodeId> = Vec::with_capacity(plan.len());
        let mut children = Vec::with_capacity(plan.len());
        for (index, spec) in plan.children().iter().enumerate() {
            // Plan validation guarantees every index refers to an earlier child.
            let depends_on = spec.depends_on.iter().filter_map(|&i| ids.get(i).copied()).collect();
            let child = TaskNode::child(parent, spec.goal.clone(), index, depends_on);
            ids.push(child.id());
            children.push(child);
        }

        for child in children {
            self.nodes.insert(child.id(), child);
        }
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.set_children(ids.clone(), plan.ordered());
        }

        Ok(ids)
    }

    /// Remove every descendant of `parent_id` and clear its child list.
    ///
    /// Returns the removed ids, parents before children.
    pub fn discard_children(&mut self, parent_id: NodeId) -> Vec<NodeId> {
        let removed = self.descendants(parent_id);
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.take_children();
        }
        for id in &removed {
            self.nodes.remove(id);
        }
        removed
    }

    pub fn get(&self, id: NodeId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(&id)
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root_id
    }

    pub fn root(&self) -> Option<&TaskNode> {
        self.root_id.and_then(|id| self.nodes.get(&id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    /// Children of `id`, in plan order.
    pub fn children(&self, id: NodeId) -> Vec<&TaskNode> {
        self.get(id)
            .map(|node| node.children().iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// All descendants of `id` (excluding itself), breadth first.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut queue: VecDeque<NodeId> = self
            .get(id)
            .map(|n| n.children().iter().copied().collect())
            .unwrap_or_default();

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.children().iter().copied());
                result.push(current);
            }
        }
        result
    }

    /// Goals from the root down to the parent of `id`.
    pub fn ancestor_goals(&self, id: NodeId) -> Vec<String> {
        let mut goals = Vec::new();
        let mut current = self.get(id).and_then(|n| n.parent_id());
        while let Some(parent_id) = current {
            match self.nodes.get(&parent_id) {
                Some(parent) => {
                    goals.push(parent.goal().to_string());
                    current = parent.parent_id();
                }
                None => break,
            }
        }
        goals.reverse();
        goals
    }

    /// Whether every dependency of `id` is `Done`.
    pub fn dependencies_met(&self, id: NodeId) -> bool {
        self.get(id)
            .map(|node| {
                node.depends_on().iter().all(|dep| {
                    self.nodes
                        .get(dep)
                        .is_some_and(|d| d.state() == NodeState::Done)
                })
            })
            .unwrap_or(false)
    }

    /// Results of the dependencies of `id`, in dependency order.
    pub fn dependency_results(&self, id: NodeId) -> Vec<(String, TaskOutput)> {
        self.get(id)
            .map(|node| {
                node.depends_on()
                    .iter()
                    .filter_map(|dep| self.nodes.get(dep))
                    .filter_map(|dep| dep.result().map(|r| (dep.goal().to_string(), r.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Siblings that list `id` as a dependency.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        let Some(parent_id) = self.get(id).and_then(|n| n.parent_id()) else {
            return Vec::new();
        };
        self.children(parent_id)
            .into_iter()
            .filter(|sibling| sibling.depends_on().contains(&id))
            .map(|sibling| sibling.id())
            .collect()
    }

    /// Move `id` to `next`, returning the previous state.
    ///
    /// Terminal states must be entered through [`complete`](Self::complete)
    /// or [`fail`](Self::fail) so the outcome is recorded with them.
    pub fn transition(&mut self, id: NodeId, next: NodeState) -> Result<NodeState, TreeError> {
        if next.is_terminal() {
            return Err(TreeError::OutcomeRequired(id));
        }
        self.apply_transition(id, next)
    }

    /// Mark `id` as `Done` with its result.
    pub fn complete(&mut self, id: NodeId, output: TaskOutput) -> Result<NodeState, TreeError> {
        let prev = self.apply_transition(id, NodeState::Done)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_outcome(NodeOutcome::Success(output));
        }
        Ok(prev)
    }

    /// Mark `id` as `Failed` with its error.
    pub fn fail(&mut self, id: NodeId, failure: NodeFailure) -> Result<NodeState, TreeError> {
        let prev = self.apply_transition(id, NodeState::Failed)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_outcome(NodeOutcome::Failure(failure));
        }
        Ok(prev)
    }

    fn apply_transition(&mut self, id: NodeId, next: NodeState) -> Result<NodeState, TreeError> {
        let node = self.nodes.get_mut(&id).ok_or(TreeError::NodeNotFound(id))?;
        let prev = node.state();
        if !prev.can_transition_to(next) {
            return Err(TreeError::InvalidTransition {
                node: id,
                from: prev,
                to: next,
            });
        }
        node.set_state(next);
        Ok(prev)
    }

    /// Snapshot of every node's state.
    pub fn states(&self) -> BTreeMap<NodeId, NodeState> {
        self.nodes.iter().map(|(id, node)| (*id, node.state())).collect()
    }
}

/// Errors in tree operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("Root node already exists")]
    RootAlreadyExists,

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} is not composite")]
    NotComposite(NodeId),

    #[error("Node {0} already has children")]
    ChildrenAlreadySet(NodeId),

    #[error("Depth {depth} exceeds maximum {max}")]
    DepthLimit { depth: u32, max: u32 },

    #[error("Invalid transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("Terminal state for {0} requires an outcome")]
    OutcomeRequired(NodeId),
}
