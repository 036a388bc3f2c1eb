//! Leaf components - each one turns a node snapshot into one provider call.
//!
//! - [`Atomizer`]: atomic or composite, plus the executor hint
//! - [`Planner`]: decomposition of a composite node
//! - [`Executor`]: runs an atomic node on its provider
//! - [`Aggregator`]: folds child results into the parent's result
//! - [`Verifier`]: accepts or rejects a result
//!
//! Components never touch the tree. They receive an owned [`WorkItem`] and
//! return a typed result or a [`StepError`]; the orchestrator applies it.

mod aggregator;
mod atomizer;
mod executor;
mod planner;
mod verifier;

pub use aggregator::Aggregator;
pub use atomizer::Atomizer;
pub use executor::Executor;
pub use planner::Planner;
pub use verifier::Verifier;

pub(crate) use atomizer::preview;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::RunContext;
use super::types::WorkItem;
use crate::provider::{ProviderFailure, ProviderOutput, ProviderRequest, RequestKind};

/// Make one provider call for `item`.
///
/// Applies the per-node timeout and abandons the call as soon as `token`
/// is cancelled.
pub(crate) async fn call_provider(
    ctx: &RunContext,
    kind: RequestKind,
    payload: Value,
    item: &WorkItem,
    token: &CancellationToken,
) -> Result<ProviderOutput, ProviderFailure> {
    let provider = ctx.providers.for_kind(kind).ok_or_else(|| {
        ProviderFailure::unrecoverable(format!("no provider configured for '{}'", kind))
    })?;

    let request = ProviderRequest {
        kind,
        payload,
        context: item.request_context(),
    };
    let timeout = ctx.config.per_node_timeout();

    tracing::debug!(
        "Calling provider '{}' ({}) for node {} attempt {}",
        provider.name(),
        kind,
        item.node_id,
        item.attempt
    );

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ProviderFailure::cancelled()),
        result = tokio::time::timeout(timeout, provider.invoke(request)) => match result {
            Ok(result) => result,
            Err(_) => Err(ProviderFailure::timeout(format!(
                "'{}' did not answer within {}ms",
                provider.name(),
                timeout.as_millis()
            ))),
        },
    }
}

/// Pull a JSON value out of provider output.
///
/// Prefers structured `data`; otherwise parses `content`, tolerating code
/// fences and prose around the JSON.
pub(crate) fn extract_json(output: &ProviderOutput) -> Option<Value> {
    if let Some(data) = &output.data {
        return Some(data.clone());
    }

    let text = output.content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Keyword signals found in free-text provider answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Mentions {
    /// First affirmed occurrence, as a word index
    pub affirmed: Option<usize>,
    pub negated: bool,
}

const NEGATIONS: &[&str] = &[
    "no", "not", "never", "without", "nothing", "don't", "dont", "doesn't", "isn't", "needn't",
];

/// Scan `text` for any of `stems`, word by word.
///
/// A stem matches words it prefixes, so "fail" also covers "failures".
/// Multi-word stems match consecutive words. A match preceded by a
/// negation within three words of the same clause counts as negated
/// instead of affirmed.
pub(crate) fn mentions(text: &str, stems: &[&str]) -> Mentions {
    let lower = text.to_lowercase();
    let mut found = Mentions::default();
    let mut offset = 0;

    for clause in lower.split(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '\n')) {
        let words: Vec<&str> = clause
            .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '-'))
            .filter(|w| !w.is_empty())
            .collect();

        for at in 0..words.len() {
            let hit = stems.iter().any(|stem| {
                let parts: Vec<&str> = stem.split_whitespace().collect();
                words.len() >= at + parts.len()
                    && parts
                        .iter()
                        .zip(&words[at..])
                        .all(|(part, word)| word.starts_with(part))
            });
            if !hit {
                continue;
            }
            let negated = words[at.saturating_sub(3)..at]
                .iter()
                .any(|w| NEGATIONS.contains(w));
            if negated {
                found.negated = true;
            } else if found.affirmed.is_none() {
                found.affirmed = Some(offset + at);
            }
        }
        offset += words.len();
    }
    found
}
