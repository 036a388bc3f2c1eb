//! Task module - the recursive task tree and its building blocks.
//!
//! - [`TaskNode`]: one unit of work with its lifecycle [`NodeState`]
//! - [`Plan`]: a validated decomposition of a composite node
//! - [`TaskTree`]: the arena owning every node of a run
//!
//! Invariants are enforced in constructors and in [`TaskTree::transition`];
//! nothing outside this module can put a node into an illegal state.

mod node;
mod plan;
mod tree;

pub use node::{NodeFailure, NodeId, NodeKind, NodeOutcome, NodeState, TaskNode, TaskOutput};
pub use plan::{ChildSpec, Plan, PlanError};
pub use tree::{TaskTree, TreeError};
