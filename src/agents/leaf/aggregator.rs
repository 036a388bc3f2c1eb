//! Aggregator - folds child results into the parent's result.

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::call_provider;
use crate::agents::context::RunContext;
use crate::agents::types::{ChildFailure, ChildResult, StepError, WorkItem};
use crate::config::{AggregationStrategy, PartialSuccessPolicy};
use crate::provider::RequestKind;
use crate::task::{NodeFailure, TaskOutput};

#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    pub fn new() -> Self {
        Self
    }

    /// Combine `results` for `item`.
    ///
    /// Results arrive in plan order, which is a valid dependency order.
    /// With `Concatenate` they are joined locally; with `Synthesize` the
    /// generate provider produces the combined answer.
    ///
    /// # Errors
    /// `Aggregation` when a required child failed, when nothing succeeded,
    /// or when the synthesis call fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn aggregate(
        &self,
        item: &WorkItem,
        strategy: AggregationStrategy,
        ordered: bool,
        results: Vec<ChildResult>,
        failures: Vec<ChildFailure>,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> Result<TaskOutput, StepError> {
        if ctx.config.partial_success_policy == PartialSuccessPolicy::Strict {
            if let Some(failed) = failures.first() {
                return Err(StepError::fatal(NodeFailure::Aggregation(format!(
                    "required child '{}' failed: {}",
                    failed.goal, failed.error
                ))));
            }
        }
        if results.is_empty() {
            return Err(StepError::fatal(NodeFailure::Aggregation(
                "no child produced a result".to_string(),
            )));
        }

        let mut results = results;
        if ordered {
            results.sort_by_key(|r| r.index);
        }
        let omitted: Vec<&str> = failures.iter().map(|f| f.goal.as_str()).collect();

        match strategy {
            AggregationStrategy::Concatenate => {
                let content = results
                    .iter()
                    .map(|r| r.output.content.trim())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let output = TaskOutput::text(content);
                Ok(if omitted.is_empty() {
                    output
                } else {
                    output.with_data(json!({ "omitted": omitted }))
                })
            }
            AggregationStrategy::Synthesize => {
                let parts: Vec<_> = results
                    .iter()
                    .map(|r| json!({ "index": r.index, "goal": r.goal, "content": r.output.content }))
                    .collect();
                let payload = json!({
                    "goal": item.goal,
                    "ancestors": item.ancestors,
                    "mode": "aggregate",
                    "ordered": ordered,
                    "results": parts,
                    "omitted": omitted,
                });

                let output = call_provider(ctx, RequestKind::Generate, payload, item, token)
                    .await
                    .map_err(|f| StepError::provider(f, NodeFailure::Aggregation))?;

                if output.content.trim().is_empty() && output.data.is_none() {
                    return Err(StepError::unusable(NodeFailure::Aggregation(
                        "synthesis returned an empty result".to_string(),
                    )));
                }
                Ok(output)
            }
        }
    }
}
