//! Task nodes, their lifecycle states and terminal outcomes.
//!
//! # Invariants
//! - `id` is assigned at creation and never changes
//! - `depth == parent.depth + 1` for every non-root node
//! - `outcome` is `Some` exactly when `state` is terminal

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::{ProviderHint, ProviderOutput};

/// Result of a node. Providers and nodes share the same output shape.
pub type TaskOutput = ProviderOutput;

/// Unique identifier for a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new unique node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Not yet classified
    Unclassified,
    /// Directly executable by one provider
    Atomic,
    /// Must be decomposed into children
    Composite,
}

/// Lifecycle state of a node.
///
/// ```text
/// Created → Classifying → Executing ─────────────→ Verifying → Done
///                       ↘ Planning → Aggregating ↗
/// any non-terminal → Failed;  Retrying → {Classifying, Executing, Planning, Aggregating, Verifying}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Created,
    Classifying,
    Executing,
    Planning,
    Aggregating,
    Verifying,
    Retrying,
    Done,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `self → next` is an edge of the state machine.
    ///
    /// Verification is optional, so `Executing` and `Aggregating` may go
    /// straight to `Done`.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;

        if next == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Created, Classifying)
                | (Classifying, Executing | Planning | Retrying)
                | (Executing, Verifying | Done | Retrying)
                | (Planning, Aggregating | Retrying)
                | (Aggregating, Verifying | Done | Retrying)
                | (Verifying, Done | Retrying)
                | (Retrying, Classifying | Executing | Planning | Aggregating | Verifying)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Classifying => "classifying",
            Self::Executing => "executing",
            Self::Planning => "planning",
            Self::Aggregating => "aggregating",
            Self::Verifying => "verifying",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn transience(transient: &bool) -> &'static str {
    if *transient {
        "transient"
    } else {
        "permanent"
    }
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum NodeFailure {
    #[error("Classification error: {0}")]
    Classification(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Execution error ({}): {reason}", transience(.transient))]
    Execution { transient: bool, reason: String },

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Verification rejected: {0}")]
    VerificationRejected(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Dependency {0} failed")]
    DependencyFailed(NodeId),

    #[error("Attempts exhausted after {attempts} attempt(s): {last}")]
    AttemptsExhausted { attempts: u32, last: Box<NodeFailure> },
}

impl NodeFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Terminal outcome of a node. Result and error are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Success(TaskOutput),
    Failure(NodeFailure),
}

/// The unit of work.
#[derive(Debug, Clone)]
pub struct TaskNode {
    id: NodeId,
    goal: String,
    kind: NodeKind,
    provider_hint: Option<ProviderHint>,
    parent_id: Option<NodeId>,
    children: Vec<NodeId>,
    depends_on: Vec<NodeId>,
    /// Position among siblings (plan index)
    index: usize,
    /// Whether the children's results are order-sensitive
    ordered_children: bool,
    state: NodeState,
    depth: u32,
    attempt: u32,
    outcome: Option<NodeOutcome>,
}

impl TaskNode {
    /// Create a root node.
    pub(crate) fn root(goal: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            goal: goal.into(),
            kind: NodeKind::Unclassified,
            provider_hint: None,
            parent_id: None,
            children: Vec::new(),
            depends_on: Vec::new(),
            index: 0,
            ordered_children: true,
            state: NodeState::Created,
            depth: 0,
            attempt: 1,
            outcome: None,
        }
    }

    /// Create a child of `parent`.
    ///
    /// # Postcondition
    /// `child.depth == parent.depth + 1`
    pub(crate) fn child(
        parent: &TaskNode,
        goal: impl Into<String>,
        index: usize,
        depends_on: Vec<NodeId>,
    ) -> Self {
        Self {
            id: NodeId::new(),
            goal: goal.into(),
            kind: NodeKind::Unclassified,
            provider_hint: None,
            parent_id: Some(parent.id),
            children: Vec::new(),
            depends_on,
            index,
            ordered_children: true,
            state: NodeState::Created,
            depth: parent.depth + 1,
            attempt: 1,
            outcome: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn provider_hint(&self) -> Option<ProviderHint> {
        self.provider_hint
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn depends_on(&self) -> &[NodeId] {
        &self.depends_on
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ordered_children(&self) -> bool {
        self.ordered_children
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn outcome(&self) -> Option<&NodeOutcome> {
        self.outcome.as_ref()
    }

    pub fn result(&self) -> Option<&TaskOutput> {
        match &self.outcome {
            Some(NodeOutcome::Success(output)) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&NodeFailure> {
        match &self.outcome {
            Some(NodeOutcome::Failure(failure)) => Some(failure),
            _ => None,
        }
    }

    pub(crate) fn classify_as(&mut self, kind: NodeKind, hint: Option<ProviderHint>) {
        self.kind = kind;
        self.provider_hint = hint;
    }

    pub(crate) fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub(crate) fn set_outcome(&mut self, outcome: NodeOutcome) {
        self.outcome = Some(outcome);
    }

    pub(crate) fn set_children(&mut self, children: Vec<NodeId>, ordered: bool) {
        self.children = children;
        self.ordered_children = ordered;
    }

    pub(crate) fn take_children(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use NodeState::*;

        assert!(Created.can_transition_to(Classifying));
        assert!(Classifying.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Aggregating));
        assert!(Aggregating.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Done));
        assert!(Retrying.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Failed));

        assert!(!Created.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Planning));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!Retrying.can_transition_to(Done));
    }

    #[test]
    fn test_child_depth() {
        let root = TaskNode::root("root");
        let child = TaskNode::child(&root, "child", 0, vec![]);
        assert_eq!(child.depth(), root.depth() + 1);
        assert_eq!(child.parent_id(), Some(root.id()));
        assert_eq!(child.attempt(), 1);
    }

    #[test]
    fn test_failure_display_and_serde() {
        let failure = NodeFailure::AttemptsExhausted {
            attempts: 2,
            last: Box::new(NodeFailure::Execution {
                transient: true,
                reason: "rate limited".into(),
            }),
        };
        assert_eq!(
            failure.to_string(),
            "Attempts exhausted after 2 attempt(s): Execution error (transient): rate limited"
        );

        let json = serde_json::to_string(&failure).expect("serialize");
        let back: NodeFailure = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, failure);
    }
}
