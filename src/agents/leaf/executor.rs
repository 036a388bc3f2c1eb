//! Executor - runs atomic nodes on their capability provider.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::agents::context::RunContext;
use crate::agents::types::{StepError, WorkItem};
use crate::task::TaskOutput;
use crate::trace::TraceEvent;

use super::call_provider;

/// Drives one attempt of an atomic node.
///
/// Retries are not looped here: the orchestrator owns the attempt counter
/// and re-dispatches the node after backoff, so every attempt is visible
/// in the tree and the trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Execute one attempt.
    ///
    /// Emits exactly one `attempt` trace event, success or failure.
    pub async fn execute(
        &self,
        item: &WorkItem,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> Result<TaskOutput, StepError> {
        let hint = item.hint.unwrap_or_default();
        let inputs: Vec<Value> = item
            .inputs
            .iter()
            .map(|(goal, output)| json!({ "goal": goal, "content": output.content }))
            .collect();
        let payload = json!({
            "goal": item.goal,
            "ancestors": item.ancestors,
            "inputs": inputs,
        });

        let event = TraceEvent::attempt(item.node_id, item.attempt)
            .with_parent(item.parent_id)
            .with_payload(&payload);

        let result = call_provider(ctx, hint.request_kind(), payload, item, token).await;

        let detail = match &result {
            Ok(_) => format!("{} succeeded", hint),
            Err(failure) => format!("{} failed: {}", hint, failure),
        };
        ctx.emit(event.with_detail(detail));

        result.map_err(StepError::execution)
    }
}
