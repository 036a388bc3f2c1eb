//! # tasktree
//!
//! Recursive task decomposition and execution engine.
//!
//! Given a goal, the engine decides whether it is directly executable
//! ("atomic") or must be split into subtasks, runs atomic work through
//! pluggable capability providers, and folds the results back up the tree.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │             Engine               │
//!        │   (submit, history, RunHandle)   │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!                ┌─────────────────┐      ┌──────────────┐
//!                │  Orchestrator   │─────▶│  TraceSink   │
//!                │  (task tree)    │      └──────────────┘
//!                └────────┬────────┘
//!                         │ WorkItem
//!                         ▼
//!   Atomizer / Planner / Executor / Aggregator / Verifier
//!                         │
//!                         ▼
//!                 CapabilityProvider
//! ```
//!
//! ## Modules
//! - `agents`: orchestrator, leaf components, engine facade
//! - `task`: task tree, node state machine, plans
//! - `provider`: capability provider interface and scripted provider
//! - `trace`: execution trace, sinks and replay
//! - `config`: engine configuration

pub mod agents;
pub mod config;
pub mod provider;
pub mod task;
pub mod trace;

pub use agents::{Engine, EngineError, ProgressEvent, RunHandle, RunOutcome, RunRequest};
pub use config::{AggregationStrategy, EngineConfig, PartialSuccessPolicy};
pub use provider::{CapabilityProvider, ProviderFailure, ProviderOutput, ProviderSet};
pub use task::{NodeFailure, NodeId, NodeState, TaskTree};
