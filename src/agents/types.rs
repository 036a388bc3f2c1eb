//! Core types shared by the leaf components and the orchestrator.

use serde::{Deserialize, Serialize};

use crate::config::{AggregationStrategy, ConfigError};
use crate::provider::{ProviderFailure, ProviderHint, RequestContext};
use crate::task::{NodeFailure, NodeId, NodeKind, NodeState, Plan, TaskOutput, TreeError};

/// Owned snapshot of a node handed to a worker.
///
/// Workers never see the tree; everything a provider call needs is copied
/// here by the scheduling loop at dispatch time.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub goal: String,
    pub kind: NodeKind,
    pub hint: Option<ProviderHint>,
    pub depth: u32,
    pub attempt: u32,
    /// Run context lines followed by ancestor goals, outermost first
    pub ancestors: Vec<String>,
    /// Results of the node's dependencies, in dependency order
    pub inputs: Vec<(String, TaskOutput)>,
}

impl WorkItem {
    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            node_id: self.node_id,
            depth: self.depth,
            attempt: self.attempt,
            ancestors: self.ancestors.clone(),
        }
    }
}

/// A finished child as seen by the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct ChildResult {
    pub index: usize,
    pub goal: String,
    pub output: TaskOutput,
}

/// A failed child as seen by the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct ChildFailure {
    pub index: usize,
    pub goal: String,
    pub error: NodeFailure,
}

/// Which provider-backed phase a node is queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Classify,
    Plan,
    Execute,
    Aggregate,
    Verify,
}

impl Phase {
    /// The node state while this phase runs.
    pub fn state(&self) -> NodeState {
        match self {
            Self::Classify => NodeState::Classifying,
            Self::Plan => NodeState::Planning,
            Self::Execute => NodeState::Executing,
            Self::Aggregate => NodeState::Aggregating,
            Self::Verify => NodeState::Verifying,
        }
    }

    /// The phase a failed attempt resumes at. Planning failures go back to
    /// classification.
    pub fn retry_phase(&self) -> Phase {
        match self {
            Self::Classify | Self::Plan => Self::Classify,
            other => *other,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Classify => "classify",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Aggregate => "aggregate",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Input of a worker job: the phase plus the data it needs.
#[derive(Debug, Clone)]
pub enum Step {
    Classify,
    Plan,
    Execute,
    Aggregate {
        strategy: AggregationStrategy,
        ordered: bool,
        results: Vec<ChildResult>,
        failures: Vec<ChildFailure>,
    },
    Verify {
        output: TaskOutput,
    },
}

impl Step {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Classify => Phase::Classify,
            Self::Plan => Phase::Plan,
            Self::Execute => Phase::Execute,
            Self::Aggregate { .. } => Phase::Aggregate,
            Self::Verify { .. } => Phase::Verify,
        }
    }
}

/// Successful result of a worker job.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Classified(Classification),
    Planned(Plan),
    Executed(TaskOutput),
    Aggregated(TaskOutput),
    Verified(Verdict),
}

/// Atomizer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: NodeKind,
    pub hint: Option<ProviderHint>,
    /// Set when the depth limit decided, not the provider
    pub forced: bool,
}

impl Classification {
    pub fn atomic(hint: Option<ProviderHint>) -> Self {
        Self {
            kind: NodeKind::Atomic,
            hint,
            forced: false,
        }
    }

    pub fn composite() -> Self {
        Self {
            kind: NodeKind::Composite,
            hint: None,
            forced: false,
        }
    }

    pub fn forced_atomic() -> Self {
        Self {
            kind: NodeKind::Atomic,
            hint: Some(ProviderHint::Generate),
            forced: true,
        }
    }
}

/// What a rejection asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    /// Produce the result again (re-execute or re-aggregate)
    Retry,
    /// Discard the children and decompose again
    Replan,
}

/// Verifier output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject { reason: String, remedy: Remedy },
}

/// A failed step, classified for the retry policy.
#[derive(Debug, Clone)]
pub struct StepError {
    pub failure: NodeFailure,
    /// Whether another attempt may succeed
    pub retryable: bool,
    /// Provider failure behind this error, used for backoff hints
    pub provider: Option<ProviderFailure>,
}

impl StepError {
    /// Wrap a provider failure. `wrap` turns the reason into the node failure.
    pub fn provider(failure: ProviderFailure, wrap: impl FnOnce(String) -> NodeFailure) -> Self {
        if failure.kind == crate::provider::FailureKind::Cancelled {
            return Self::cancelled();
        }
        Self {
            failure: wrap(failure.to_string()),
            retryable: failure.is_transient(),
            provider: Some(failure),
        }
    }

    /// A provider failure during execution keeps the transient flag visible.
    pub fn execution(failure: ProviderFailure) -> Self {
        let transient = failure.is_transient();
        Self::provider(failure, |reason| NodeFailure::Execution { transient, reason })
    }

    /// Output that could not be used. Providers are non-deterministic, so
    /// another attempt may produce something usable.
    pub fn unusable(failure: NodeFailure) -> Self {
        Self {
            failure,
            retryable: true,
            provider: None,
        }
    }

    /// A failure no retry can fix.
    pub fn fatal(failure: NodeFailure) -> Self {
        Self {
            failure,
            retryable: false,
            provider: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::fatal(NodeFailure::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure.is_cancelled()
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.failure.fmt(f)
    }
}

/// Progress notification for UI drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub state: NodeState,
    pub attempt: u32,
    pub summary: String,
}

/// Run-level errors. Node failures are not engine errors; they are part
/// of the run outcome.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Task tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Goal must not be empty")]
    EmptyGoal,

    #[error("Engine internal error: {0}")]
    Internal(String),
}
