//! Planner - decomposes a composite node into children.
//!
//! Accepted answers:
//! - `{"subtasks": [{"goal": "...", "depends_on": [0]}], "ordered": true, "reasoning": "..."}`
//! - a bare array of such objects, or of plain goal strings (a linear list
//!   without dependencies)
//!
//! Dependencies are indices into the list and may only point backwards.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::atomizer::preview;
use super::{call_provider, extract_json};
use crate::agents::context::RunContext;
use crate::agents::types::{StepError, WorkItem};
use crate::provider::{ProviderOutput, RequestKind};
use crate::task::{ChildSpec, NodeFailure, Plan};

#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// Ask the reasoning provider for a plan.
    ///
    /// # Errors
    /// `Planning` on provider failure or an invalid plan (fewer than two
    /// children, self or forward dependency).
    pub async fn decompose(
        &self,
        item: &WorkItem,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> Result<Plan, StepError> {
        let inputs: Vec<Value> = item
            .inputs
            .iter()
            .map(|(goal, output)| json!({ "goal": goal, "content": output.content }))
            .collect();
        let payload = json!({
            "goal": item.goal,
            "ancestors": item.ancestors,
            "depth": item.depth,
            "inputs": inputs,
        });

        let output = call_provider(ctx, RequestKind::Plan, payload, item, token)
            .await
            .map_err(|f| StepError::provider(f, NodeFailure::Planning))?;

        Self::parse(&output).map_err(|reason| StepError::unusable(NodeFailure::Planning(reason)))
    }

    /// Parse and validate provider output.
    pub fn parse(output: &ProviderOutput) -> Result<Plan, String> {
        let value = extract_json(output)
            .ok_or_else(|| format!("no JSON plan in response: {}", preview(&output.content)))?;

        let (entries, ordered, reasoning) = match &value {
            Value::Array(entries) => (entries.as_slice(), true, String::new()),
            Value::Object(obj) => {
                let entries = ["subtasks", "children", "steps"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(|v| v.as_array()))
                    .ok_or_else(|| "plan has no 'subtasks' array".to_string())?;
                let ordered = obj.get("ordered").and_then(|v| v.as_bool()).unwrap_or(true);
                let reasoning = obj
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (entries.as_slice(), ordered, reasoning)
            }
            other => return Err(format!("unexpected plan shape: {}", other)),
        };

        let children = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| match entry {
                Value::String(goal) => Ok(ChildSpec::new(goal.clone())),
                Value::Object(_) => serde_json::from_value::<ChildSpec>(entry.clone())
                    .map_err(|e| format!("subtask {}: {}", index, e)),
                other => Err(format!("subtask {} is not an object: {}", index, other)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Plan::new(children, ordered, reasoning).map_err(|e| e.to_string())
    }
}
