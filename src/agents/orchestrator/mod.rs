//! Orchestration - the scheduling loop and the engine facade around it.

mod engine;
mod queue;
mod root;

pub use engine::{Engine, EngineStatus, RunHandle, RunRecord, RunRequest};
pub use root::{Control, Orchestrator, RunOutcome};
