//! Scripted provider for tests, dry runs and replays.
//!
//! Responses come from per-kind handlers or, for the CLI, from a JSON
//! [`Script`] keyed by goal. Every call is recorded with its timing so tests
//! can assert ordering and the peak number of concurrent calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{CapabilityProvider, ProviderFailure, ProviderOutput, ProviderRequest, RequestKind};
use crate::task::NodeId;

type Handler =
    Arc<dyn Fn(&ProviderRequest) -> Result<ProviderOutput, ProviderFailure> + Send + Sync>;

/// A call observed by a [`ScriptedProvider`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: RequestKind,
    pub goal: Option<String>,
    pub node_id: NodeId,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Instant,
    pub succeeded: bool,
}

/// Goal-keyed responses, loadable from JSON.
///
/// ```json
/// {
///   "classify": { "write a report": "composite", "find sources": "atomic:search" },
///   "plan": { "write a report": { "subtasks": [ { "goal": "find sources" },
///                                               { "goal": "draft", "depends_on": [0] } ] } },
///   "results": { "find sources": "three sources" },
///   "verify": { "draft": { "verdict": "accept" } }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub classify: HashMap<String, String>,
    pub plan: HashMap<String, serde_json::Value>,
    pub results: HashMap<String, String>,
    pub verify: HashMap<String, serde_json::Value>,
}

impl Script {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Provider whose answers are fully scripted.
pub struct ScriptedProvider {
    name: String,
    handlers: HashMap<RequestKind, Handler>,
    latency: Duration,
    goal_latency: HashMap<String, Duration>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    /// Create a provider answering with the default behaviour for every kind.
    ///
    /// Defaults: classify → atomic, plan → malformed, execution → `"done: <goal>"`,
    /// aggregation → results joined in order, verify → accept.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            latency: Duration::ZERO,
            goal_latency: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Build a provider from a goal-keyed script.
    pub fn from_script(name: impl Into<String>, script: Script) -> Self {
        let script = Arc::new(script);

        let classify = Arc::clone(&script);
        let plan = Arc::clone(&script);
        let verify = Arc::clone(&script);
        let results = script;

        let mut provider = Self::new(name)
            .on(RequestKind::Classify, move |req| {
                let goal = req.goal().unwrap_or_default();
                let entry = classify.classify.get(goal).map(String::as_str).unwrap_or("atomic");
                let (kind, hint) = match entry.split_once(':') {
                    Some((kind, hint)) => (kind.trim(), Some(hint.trim())),
                    None => (entry.trim(), None),
                };
                Ok(ProviderOutput::json(json!({ "kind": kind, "provider": hint })))
            })
            .on(RequestKind::Plan, move |req| {
                let goal = req.goal().unwrap_or_default();
                plan.plan
                    .get(goal)
                    .map(|p| ProviderOutput::json(p.clone()))
                    .ok_or_else(|| ProviderFailure::malformed(format!("no plan scripted for '{}'", goal)))
            })
            .on(RequestKind::Verify, move |req| {
                let goal = req.goal().unwrap_or_default();
                let verdict = verify
                    .verify
                    .get(goal)
                    .cloned()
                    .unwrap_or_else(|| json!({ "verdict": "accept" }));
                Ok(ProviderOutput::json(verdict))
            });

        for kind in [RequestKind::Generate, RequestKind::Search, RequestKind::Compute] {
            let results = Arc::clone(&results);
            provider = provider.on(kind, move |req| {
                if is_aggregation(req) {
                    return Ok(join_results(req));
                }
                let goal = req.goal().unwrap_or_default();
                Ok(ProviderOutput::text(
                    results
                        .results
                        .get(goal)
                        .cloned()
                        .unwrap_or_else(|| format!("done: {}", goal)),
                ))
            });
        }

        provider
    }

    /// Install a handler for one request kind.
    pub fn on<F>(mut self, kind: RequestKind, handler: F) -> Self
    where
        F: Fn(&ProviderRequest) -> Result<ProviderOutput, ProviderFailure> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay calls for one goal by `latency` (overrides the global latency).
    pub fn with_goal_latency(mut self, goal: impl Into<String>, latency: Duration) -> Self {
        self.goal_latency.insert(goal.into(), latency);
        self
    }

    /// All calls observed so far, in completion order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Calls of one kind, in completion order.
    pub fn calls_of(&self, kind: RequestKind) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn default_response(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderFailure> {
        let goal = request.goal().unwrap_or_default();
        match request.kind {
            RequestKind::Classify => Ok(ProviderOutput::json(json!({ "kind": "atomic" }))),
            RequestKind::Plan => Err(ProviderFailure::malformed(format!(
                "no plan scripted for '{}'",
                goal
            ))),
            RequestKind::Verify => Ok(ProviderOutput::json(json!({ "verdict": "accept" }))),
            RequestKind::Generate | RequestKind::Search | RequestKind::Compute => {
                if is_aggregation(request) {
                    Ok(join_results(request))
                } else {
                    Ok(ProviderOutput::text(format!("done: {}", goal)))
                }
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderOutput, ProviderFailure> {
        let started = Instant::now();
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak.fetch_max(current, Ordering::SeqCst);

        let latency = request
            .goal()
            .and_then(|g| self.goal_latency.get(g).copied())
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = match self.handlers.get(&request.kind) {
            Some(handler) => handler(&request),
            None => self.default_response(&request),
        };

        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(RecordedCall {
                kind: request.kind,
                goal: request.goal().map(str::to_string),
                node_id: request.context.node_id,
                attempt: request.context.attempt,
                started,
                finished: Instant::now(),
                succeeded: result.is_ok(),
            });

        result
    }
}

/// Whether a generate request is an aggregation (synthesis) request.
pub fn is_aggregation(request: &ProviderRequest) -> bool {
    request.payload.get("mode").and_then(|m| m.as_str()) == Some("aggregate")
}

fn join_results(request: &ProviderRequest) -> ProviderOutput {
    let parts: Vec<&str> = request
        .payload
        .get("results")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|r| r.get("content").and_then(|c| c.as_str()))
                .collect()
        })
        .unwrap_or_default();
    ProviderOutput::text(parts.join("\n"))
}
