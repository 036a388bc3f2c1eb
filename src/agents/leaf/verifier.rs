//! Verifier - accepts or rejects a node's result against its goal.
//!
//! Accepted answers:
//! - `{"verdict": "accept"}` / `{"verdict": "reject", "reason": "...", "action": "replan"}`
//! - `{"passed": true|false, "reasoning": "..."}`
//! - free text mentioning reject/fail or accept/pass, but not both

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::atomizer::preview;
use super::{call_provider, extract_json, mentions};
use crate::agents::context::RunContext;
use crate::agents::types::{Remedy, StepError, Verdict, WorkItem};
use crate::provider::{ProviderOutput, RequestKind};
use crate::task::{NodeFailure, TaskOutput};

#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// Verify `output` for `item`.
    ///
    /// A failed verifier call is an execution failure with the usual
    /// transient/permanent split, not a rejection.
    pub async fn verify(
        &self,
        item: &WorkItem,
        output: &TaskOutput,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> Result<Verdict, StepError> {
        let payload = json!({
            "goal": item.goal,
            "ancestors": item.ancestors,
            "kind": item.kind,
            "result": output.content,
            "data": output.data,
        });

        let response = call_provider(ctx, RequestKind::Verify, payload, item, token)
            .await
            .map_err(|f| {
                let transient = f.is_transient();
                StepError::provider(f, |reason| NodeFailure::Execution {
                    transient,
                    reason: format!("verifier: {}", reason),
                })
            })?;

        Self::parse(&response).ok_or_else(|| {
            StepError::unusable(NodeFailure::Execution {
                transient: true,
                reason: format!("unparseable verdict: {}", preview(&response.content)),
            })
        })
    }

    pub fn parse(output: &ProviderOutput) -> Option<Verdict> {
        match extract_json(output) {
            Some(value @ Value::Object(_)) => Self::parse_json(&value),
            _ => Self::parse_text(&output.content),
        }
    }

    fn parse_json(value: &Value) -> Option<Verdict> {
        let accepted = match ["verdict", "decision", "status"]
            .iter()
            .find_map(|key| value[*key].as_str())
        {
            Some(verdict) => match verdict.trim().to_lowercase().as_str() {
                "accept" | "accepted" | "pass" | "passed" | "approve" | "approved" => true,
                "reject" | "rejected" | "fail" | "failed" => false,
                _ => return None,
            },
            None => ["passed", "accepted", "accept"]
                .iter()
                .find_map(|key| value[*key].as_bool())?,
        };

        if accepted {
            return Some(Verdict::Accept);
        }

        let reason = ["reason", "reasoning", "feedback"]
            .iter()
            .find_map(|key| value[*key].as_str())
            .unwrap_or("no reason given")
            .to_string();
        let remedy = ["action", "remedy"]
            .iter()
            .find_map(|key| value[*key].as_str())
            .map(remedy_from_text)
            .unwrap_or(Remedy::Retry);

        Some(Verdict::Reject { reason, remedy })
    }

    /// Free-text fallback. Negated mentions ("no failures", "not rejected")
    /// are ignored; an answer carrying both accept and reject signals is
    /// treated as unparseable.
    fn parse_text(text: &str) -> Option<Verdict> {
        let reject = mentions(text, &["reject", "fail"]).affirmed;
        let accept = mentions(text, &["accept", "pass", "succe", "completed", "approve"]).affirmed;

        match (accept, reject) {
            (Some(_), None) => Some(Verdict::Accept),
            (None, Some(_)) => Some(Verdict::Reject {
                reason: text.trim().to_string(),
                remedy: remedy_from_text(text),
            }),
            _ => None,
        }
    }
}

fn remedy_from_text(text: &str) -> Remedy {
    let lower = text.to_lowercase();
    if lower.contains("replan") || lower.contains("re-plan") || lower.contains("decompos") {
        Remedy::Replan
    } else {
        Remedy::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_verdicts() {
        assert_eq!(
            Verifier::parse(&ProviderOutput::json(json!({ "verdict": "accept" }))),
            Some(Verdict::Accept)
        );
        assert_eq!(
            Verifier::parse(&ProviderOutput::json(json!({
                "verdict": "reject",
                "reason": "misses step 3",
                "action": "replan"
            }))),
            Some(Verdict::Reject {
                reason: "misses step 3".into(),
                remedy: Remedy::Replan
            })
        );
        assert_eq!(
            Verifier::parse(&ProviderOutput::text(r#"{"passed": false, "reasoning": "too short"}"#)),
            Some(Verdict::Reject {
                reason: "too short".into(),
                remedy: Remedy::Retry
            })
        );
        assert_eq!(Verifier::parse(&ProviderOutput::json(json!({ "verdict": "maybe" }))), None);
    }

    #[test]
    fn test_parse_text_verdicts() {
        assert_eq!(
            Verifier::parse(&ProviderOutput::text("Looks complete, PASS.")),
            Some(Verdict::Accept)
        );
        assert!(matches!(
            Verifier::parse(&ProviderOutput::text("Rejected: please re-plan the approach")),
            Some(Verdict::Reject { remedy: Remedy::Replan, .. })
        ));
        assert_eq!(Verifier::parse(&ProviderOutput::text("hmm")), None);
    }

    #[test]
    fn test_parse_text_ignores_negated_failures() {
        assert_eq!(
            Verifier::parse(&ProviderOutput::text("PASS: all checks succeeded, no failures found.")),
            Some(Verdict::Accept)
        );
        assert_eq!(
            Verifier::parse(&ProviderOutput::text("The result was not rejected by any check; accepted.")),
            Some(Verdict::Accept)
        );
        assert!(matches!(
            Verifier::parse(&ProviderOutput::text("Two failures found in the summary.")),
            Some(Verdict::Reject { remedy: Remedy::Retry, .. })
        ));
    }

    #[test]
    fn test_parse_text_conflicting_signals_is_unparseable() {
        assert_eq!(
            Verifier::parse(&ProviderOutput::text("Step one passed but step two failed.")),
            None
        );
    }
}
