//! Atomizer - decides whether a node is atomic or composite.
//!
//! # Algorithm
//! 1. At or beyond the depth limit, answer atomic without asking anyone
//! 2. Otherwise ask the reasoning provider with the goal and ancestor goals
//! 3. Parse `{"kind": "atomic"|"composite", "provider": "..."}`, falling
//!    back to keywords in free text

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{call_provider, extract_json, mentions};
use crate::agents::context::RunContext;
use crate::agents::types::{Classification, StepError, WorkItem};
use crate::provider::{ProviderHint, ProviderOutput, RequestKind};
use crate::task::NodeFailure;

/// Classifies nodes through the reasoning provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Atomizer;

impl Atomizer {
    pub fn new() -> Self {
        Self
    }

    /// Classify a node.
    ///
    /// # Errors
    /// `Classification` when the provider fails or its answer cannot be parsed.
    pub async fn classify(
        &self,
        item: &WorkItem,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> Result<Classification, StepError> {
        if let Some(forced) = Self::depth_limited(item.depth, ctx.config.max_depth) {
            return Ok(forced);
        }

        let payload = json!({
            "goal": item.goal,
            "ancestors": item.ancestors,
            "depth": item.depth,
            "max_depth": ctx.config.max_depth,
        });

        let output = call_provider(ctx, RequestKind::Classify, payload, item, token)
            .await
            .map_err(|f| StepError::provider(f, NodeFailure::Classification))?;

        Self::parse(&output).ok_or_else(|| {
            StepError::unusable(NodeFailure::Classification(format!(
                "unparseable classification: {}",
                preview(&output.content)
            )))
        })
    }

    /// The forced classification for nodes at the depth ceiling.
    pub fn depth_limited(depth: u32, max_depth: u32) -> Option<Classification> {
        (depth >= max_depth).then(Classification::forced_atomic)
    }

    /// Parse provider output into a classification.
    pub fn parse(output: &ProviderOutput) -> Option<Classification> {
        match extract_json(output) {
            Some(value @ Value::Object(_)) => Self::parse_json(&value),
            _ => Self::parse_text(&output.content),
        }
    }

    fn parse_json(value: &Value) -> Option<Classification> {
        let hint = ["provider", "provider_hint", "capability"]
            .iter()
            .find_map(|key| value[*key].as_str())
            .and_then(ProviderHint::parse_lenient);

        if let Some(kind) = ["kind", "type", "classification"]
            .iter()
            .find_map(|key| value[*key].as_str())
        {
            return match kind.trim().to_lowercase().as_str() {
                "atomic" | "simple" | "leaf" => Some(Classification::atomic(hint)),
                "composite" | "complex" | "decompose" => Some(Classification::composite()),
                _ => None,
            };
        }

        value["atomic"].as_bool().map(|atomic| {
            if atomic {
                Classification::atomic(hint)
            } else {
                Classification::composite()
            }
        })
    }

    /// Free-text fallback. A negated keyword counts for the other side
    /// ("no need to decompose" reads as atomic); conflicting signals leave
    /// the answer unparseable.
    fn parse_text(text: &str) -> Option<Classification> {
        let atomic = mentions(text, &["atomic", "directly executable"]);
        let composite = mentions(text, &["composite", "decompos", "split"]);

        let says_atomic = atomic.affirmed.is_some() || composite.negated;
        let says_composite = composite.affirmed.is_some() || atomic.negated;
        match (says_atomic, says_composite) {
            (true, false) => Some(Classification::atomic(ProviderHint::parse_lenient(
                &text.to_lowercase(),
            ))),
            (false, true) => Some(Classification::composite()),
            _ => None,
        }
    }
}

pub(crate) fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
