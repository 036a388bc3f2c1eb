//! Agents module - recursive task execution.
//!
//! # Components
//! - **Orchestrator**: owns the tree, schedules nodes, applies results
//! - **Leaf components**: Atomizer, Planner, Executor, Aggregator, Verifier
//! - **Engine**: submits runs and keeps their history
//!
//! # Design Principles
//! - One writer: only the orchestrator mutates the tree
//! - Workers get owned snapshots and return typed results
//! - Retries are explicit attempt counters, visible in the trace

mod context;
pub mod leaf;
pub mod orchestrator;
mod retry;
mod types;

pub use context::RunContext;
pub use orchestrator::{
    Control, Engine, EngineStatus, Orchestrator, RunHandle, RunOutcome, RunRecord, RunRequest,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use types::{
    ChildFailure, ChildResult, Classification, EngineError, Phase, ProgressEvent, Remedy, Step,
    StepError, StepOutcome, Verdict, WorkItem,
};
