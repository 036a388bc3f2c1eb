//! Engine - entry point for hosts and UI drivers.
//!
//! An [`Engine`] holds configuration, providers and the optional trace
//! sink. Each [`Engine::submit`] builds a fresh [`RunContext`] and tree,
//! spawns the orchestrator, and hands back a [`RunHandle`] for progress,
//! cancellation and the final outcome.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::root::{Control, Orchestrator, RunOutcome};
use crate::agents::context::RunContext;
use crate::agents::leaf::preview;
use crate::agents::types::{EngineError, ProgressEvent};
use crate::config::EngineConfig;
use crate::provider::ProviderSet;
use crate::task::{NodeId, NodeState};
use crate::trace::{TraceEmitter, TraceSink, TraceWriter};

/// A goal submitted to the engine.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub goal: String,
    /// Background lines given to providers ahead of the ancestor goals
    pub context: Vec<String>,
}

impl RunRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, line: impl Into<String>) -> Self {
        self.context.push(line.into());
        self
    }
}

/// Summary of a finished run kept in the engine history.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub root_id: NodeId,
    pub goal: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: NodeState,
    pub node_count: usize,
    /// Result preview, or the root failure
    pub summary: String,
}

impl RunRecord {
    fn from_outcome(goal: String, started_at: DateTime<Utc>, outcome: &RunOutcome) -> Self {
        let state = outcome
            .tree
            .get(outcome.root_id)
            .map(|r| r.state())
            .unwrap_or(NodeState::Failed);
        let summary = match &outcome.result {
            Ok(output) => preview(&output.content),
            Err(failure) => failure.to_string(),
        };
        Self {
            root_id: outcome.root_id,
            goal,
            started_at,
            finished_at: Utc::now(),
            state,
            node_count: outcome.tree.len(),
            summary,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active_runs: usize,
    pub runs_recorded: usize,
    pub last_run: Option<RunRecord>,
}

/// Recursive task engine.
pub struct Engine {
    config: Arc<EngineConfig>,
    providers: ProviderSet,
    trace_sink: Option<Arc<dyn TraceSink>>,
    history: Arc<RwLock<VecDeque<RunRecord>>>,
    active: Arc<AtomicUsize>,
}

impl Engine {
    /// Create an engine.
    ///
    /// # Errors
    /// `Config` when the configuration cannot be run with. Soft problems are
    /// logged as warnings.
    pub fn new(config: EngineConfig, providers: ProviderSet) -> Result<Self, EngineError> {
        for warning in config.validate()? {
            tracing::warn!("Config: {}", warning);
        }
        Ok(Self {
            config: Arc::new(config),
            providers,
            trace_sink: None,
            history: Arc::new(RwLock::new(VecDeque::new())),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Record every run's trace into `sink`.
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: RunRequest) -> Result<RunHandle, EngineError> {
        let goal = request.goal.trim().to_string();
        if goal.is_empty() {
            return Err(EngineError::EmptyGoal);
        }

        let (trace, writer) = match &self.trace_sink {
            Some(sink) => {
                let (emitter, writer) = TraceWriter::spawn(Arc::clone(sink));
                (emitter, Some(writer))
            }
            None => (TraceEmitter::disabled(), None),
        };
        let (progress_tx, progress_rx) = broadcast::channel(self.config.progress_buffer.max(1));
        let ctx = Arc::new(RunContext::new(
            Arc::clone(&self.config),
            self.providers.clone(),
            trace,
            progress_tx,
            request.context,
        ));
        let cancel = ctx.cancel_token.clone();

        let (orchestrator, control) = Orchestrator::new(ctx, goal.clone())?;
        let root_id = orchestrator.root_id();

        let history = Arc::clone(&self.history);
        let limit = self.config.history_limit;
        let active = ActiveRun::enter(Arc::clone(&self.active));
        let started_at = Utc::now();

        let task = tokio::spawn(async move {
            let _active = active;
            let outcome = orchestrator.run().await;

            if let Some(writer) = writer {
                let written = writer.finish().await;
                tracing::debug!("Run {} wrote {} trace events", root_id, written);
            }

            if let Ok(outcome) = &outcome {
                let record = RunRecord::from_outcome(goal, started_at, outcome);
                let mut history = history.write().await;
                history.push_back(record);
                while history.len() > limit {
                    history.pop_front();
                }
            }
            outcome
        });

        Ok(RunHandle {
            root_id,
            progress: Some(progress_rx),
            cancel,
            control,
            task,
        })
    }

    /// Submit a run and wait for it.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, EngineError> {
        self.submit(request)?.wait().await
    }

    /// Finished runs, oldest first.
    pub async fn history(&self) -> Vec<RunRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn status(&self) -> EngineStatus {
        let history = self.history.read().await;
        EngineStatus {
            active_runs: self.active.load(Ordering::SeqCst),
            runs_recorded: history.len(),
            last_run: history.back().cloned(),
        }
    }
}

/// Counts a run as active until dropped.
struct ActiveRun(Arc<AtomicUsize>);

impl ActiveRun {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a submitted run.
pub struct RunHandle {
    root_id: NodeId,
    progress: Option<broadcast::Receiver<ProgressEvent>>,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<Result<RunOutcome, EngineError>>,
}

impl RunHandle {
    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    /// Take the progress stream. It was subscribed before the run started,
    /// so no event is missed. Returns `None` after the first call.
    pub fn progress(&mut self) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.progress.take()
    }

    /// Cancel the whole run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels the whole run, for signal handlers and other tasks.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel one node and its subtree. Returns `false` if the run already ended.
    pub fn cancel_node(&self, node_id: NodeId) -> bool {
        self.control.send(Control::CancelNode(node_id)).is_ok()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunOutcome, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("run task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::PartialSuccessPolicy;
    use crate::provider::scripted::{is_aggregation, Script};
    use crate::provider::{ProviderFailure, ProviderOutput, RequestKind, ScriptedProvider};
    use crate::task::{NodeFailure, NodeKind, TaskTree};
    use crate::trace::{read_jsonl, replay, JsonlTraceSink, MemoryTraceSink, TraceEvent, TraceKind};

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        }
    }

    fn script(value: serde_json::Value) -> Script {
        serde_json::from_value(value).expect("script")
    }

    fn engine(config: EngineConfig, provider: Arc<ScriptedProvider>) -> (Engine, Arc<MemoryTraceSink>) {
        let sink = Arc::new(MemoryTraceSink::new());
        let engine = Engine::new(config, ProviderSet::uniform(provider))
            .expect("engine")
            .with_trace_sink(sink.clone());
        (engine, sink)
    }

    fn child_id(tree: &TaskTree, goal: &str) -> NodeId {
        tree.iter()
            .find(|n| n.goal() == goal)
            .map(|n| n.id())
            .expect("node with goal")
    }

    fn transition_seq(events: &[TraceEvent], node: NodeId, to: NodeState) -> u64 {
        events
            .iter()
            .find(|e| e.kind == TraceKind::Transition && e.node_id == node && e.to == Some(to))
            .map(|e| e.seq)
            .expect("transition event")
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_order() {
        let provider = Arc::new(ScriptedProvider::from_script(
            "script",
            script(json!({
                "classify": { "produce a 3-step plan": "composite" },
                "plan": { "produce a 3-step plan": { "subtasks": [
                    { "goal": "step 1" },
                    { "goal": "step 2", "depends_on": [0] },
                    { "goal": "step 3", "depends_on": [1] }
                ], "reasoning": "each step feeds the next" } },
                "results": { "step 1": "one", "step 2": "two", "step 3": "three" }
            })),
        ));
        let (engine, sink) = engine(fast_config(), provider.clone());

        let outcome = engine.run(RunRequest::new("produce a 3-step plan")).await.expect("run");
        let output = outcome.result.clone().expect("root result");
        assert_eq!(output.content, "one\ntwo\nthree");

        let root = outcome.tree.root().expect("root");
        assert_eq!(root.state(), NodeState::Done);
        assert_eq!(root.kind(), NodeKind::Composite);
        assert_eq!(root.attempt(), 1);

        let steps: Vec<_> = provider
            .calls_of(RequestKind::Generate)
            .into_iter()
            .filter(|c| c.goal.as_deref().is_some_and(|g| g.starts_with("step")))
            .collect();
        let goals: Vec<_> = steps.iter().filter_map(|c| c.goal.clone()).collect();
        assert_eq!(goals, vec!["step 1", "step 2", "step 3"]);
        for pair in steps.windows(2) {
            assert!(pair[0].finished <= pair[1].started);
        }
        assert_eq!(provider.calls_of(RequestKind::Verify).len(), 1);

        // Dependents start classifying only after their dependency is done.
        let events = sink.events().await;
        let ids: Vec<_> = ["step 1", "step 2", "step 3"]
            .iter()
            .map(|g| child_id(&outcome.tree, g))
            .collect();
        for id in &ids {
            let created = events
                .iter()
                .find(|e| e.kind == TraceKind::Created && e.node_id == *id)
                .expect("created event");
            assert_eq!(created.detail.as_deref(), Some("each step feeds the next"));
        }
        for pair in ids.windows(2) {
            let done = transition_seq(&events, pair[0], NodeState::Done);
            let started = transition_seq(&events, pair[1], NodeState::Classifying);
            assert!(done < started);
        }

        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let provider = Arc::new(ScriptedProvider::new("flaky").on(RequestKind::Generate, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderFailure::timeout("upstream slow"))
            } else {
                Ok(ProviderOutput::text("second try"))
            }
        }));
        let config = EngineConfig {
            max_attempts: 2,
            ..fast_config()
        };
        let (engine, sink) = engine(config, provider);

        let outcome = engine.run(RunRequest::new("answer")).await.expect("run");
        assert_eq!(outcome.result.expect("result").content, "second try");

        let root = outcome.tree.root().expect("root");
        assert_eq!(root.state(), NodeState::Done);
        assert_eq!(root.attempt(), 2);

        let events = sink.events().await;
        let attempts: Vec<_> = events
            .iter()
            .filter(|e| e.kind == TraceKind::Attempt && e.node_id == root.id())
            .collect();
        assert_eq!(attempts.len(), 2);
        assert!(events.iter().any(|e| e.to == Some(NodeState::Retrying) && e.attempt == 2));
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_without_retry() {
        let provider = Arc::new(ScriptedProvider::new("p").on(RequestKind::Generate, |_| {
            Err(ProviderFailure::malformed("prompt rejected"))
        }));
        let (engine, _) = engine(fast_config(), provider.clone());

        let outcome = tokio_test::assert_ok!(engine.run(RunRequest::new("answer")).await);
        assert!(matches!(
            outcome.result,
            Err(NodeFailure::Execution { transient: false, .. })
        ));
        assert_eq!(provider.calls_of(RequestKind::Generate).len(), 1);
    }

    #[tokio::test]
    async fn test_reject_with_replan_creates_fresh_children() {
        let verdicts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&verdicts);
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "report": "composite" },
                    "plan": { "report": { "subtasks": [ { "goal": "a" }, { "goal": "b" } ] } }
                })),
            )
            .on(RequestKind::Verify, move |_| {
                Ok(if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    ProviderOutput::json(json!({
                        "verdict": "reject",
                        "reason": "wrong split",
                        "action": "replan"
                    }))
                } else {
                    ProviderOutput::json(json!({ "verdict": "accept" }))
                })
            }),
        );
        let (engine, sink) = engine(fast_config(), provider.clone());

        let outcome = engine.run(RunRequest::new("report")).await.expect("run");
        assert!(outcome.is_success());

        let root = outcome.tree.root().expect("root");
        assert_eq!(root.attempt(), 2);
        assert_eq!(outcome.tree.len(), 3);
        assert_eq!(provider.calls_of(RequestKind::Plan).len(), 2);

        let events = sink.events().await;
        let discarded: HashSet<NodeId> = events
            .iter()
            .filter(|e| e.kind == TraceKind::Discarded)
            .map(|e| e.node_id)
            .collect();
        assert_eq!(discarded.len(), 2);
        for child in root.children() {
            assert!(!discarded.contains(child));
        }
        assert!(events
            .iter()
            .any(|e| e.node_id == root.id() && e.from == Some(NodeState::Retrying) && e.to == Some(NodeState::Planning)));

        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }

    #[tokio::test]
    async fn test_reject_retries_aggregation_with_alternate_strategy() {
        let verdicts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&verdicts);
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "report": "composite" },
                    "plan": { "report": { "subtasks": [ { "goal": "a" }, { "goal": "b" } ] } }
                })),
            )
            .on(RequestKind::Verify, move |_| {
                Ok(if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    ProviderOutput::json(json!({ "verdict": "reject", "reason": "too terse" }))
                } else {
                    ProviderOutput::json(json!({ "verdict": "accept" }))
                })
            }),
        );
        let (engine, _) = engine(fast_config(), provider.clone());

        let outcome = engine.run(RunRequest::new("report")).await.expect("run");
        assert_eq!(outcome.result.expect("result").content, "done: a\n\ndone: b");
        assert_eq!(provider.calls_of(RequestKind::Plan).len(), 1);
        assert_eq!(provider.calls_of(RequestKind::Verify).len(), 2);
    }

    #[tokio::test]
    async fn test_rejections_exhaust_attempts() {
        let provider = Arc::new(ScriptedProvider::new("p").on(RequestKind::Verify, |_| {
            Ok(ProviderOutput::json(json!({ "verdict": "reject", "reason": "never good" })))
        }));
        let config = EngineConfig {
            max_attempts: 2,
            verify_atomic: true,
            ..fast_config()
        };
        let (engine, _) = engine(config, provider.clone());

        let outcome = engine.run(RunRequest::new("answer")).await.expect("run");
        match outcome.result {
            Err(NodeFailure::AttemptsExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, NodeFailure::VerificationRejected(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(provider.calls_of(RequestKind::Generate).len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_run_fails_every_node() {
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "root": "composite" },
                    "plan": { "root": { "subtasks": [ { "goal": "x" }, { "goal": "y" }, { "goal": "z" } ] } }
                })),
            )
            .with_goal_latency("x", Duration::from_secs(30))
            .with_goal_latency("y", Duration::from_secs(30))
            .with_goal_latency("z", Duration::from_secs(30)),
        );
        let (engine, sink) = engine(fast_config(), provider);

        let mut handle = engine.submit(RunRequest::new("root")).expect("submit");
        let mut progress = handle.progress().expect("progress");
        loop {
            let event = progress.recv().await.expect("progress event");
            if event.state == NodeState::Classifying && event.parent_id.is_some() {
                break;
            }
        }
        handle.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("cancellation is prompt")
            .expect("run");
        assert_eq!(outcome.result, Err(NodeFailure::Cancelled));
        assert_eq!(outcome.tree.len(), 4);
        for node in outcome.tree.iter() {
            assert_eq!(node.state(), NodeState::Failed);
            assert_eq!(node.error(), Some(&NodeFailure::Cancelled));
        }

        let events = sink.events().await;
        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }

    #[tokio::test]
    async fn test_cancel_node_under_best_effort() {
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "root": "composite" },
                    "plan": { "root": { "subtasks": [ { "goal": "slow" }, { "goal": "fast" } ] } }
                })),
            )
            .with_goal_latency("slow", Duration::from_secs(30)),
        );
        let config = EngineConfig {
            partial_success_policy: PartialSuccessPolicy::BestEffort,
            ..fast_config()
        };
        let (engine, _) = engine(config, provider);

        let mut handle = engine.submit(RunRequest::new("root")).expect("submit");
        let mut progress = handle.progress().expect("progress");
        let slow = loop {
            let event = progress.recv().await.expect("progress event");
            if event.state == NodeState::Created && event.summary == "slow" {
                break event.node_id;
            }
        };
        assert!(handle.cancel_node(slow));

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("run finishes")
            .expect("run");
        assert_eq!(outcome.result.expect("result").content, "done: fast");
        let slow = outcome.tree.get(slow).expect("slow node");
        assert_eq!(slow.error(), Some(&NodeFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_reaches_grandchildren() {
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "root": "composite", "mid": "composite" },
                    "plan": {
                        "root": { "subtasks": [ { "goal": "mid" }, { "goal": "side" } ] },
                        "mid": { "subtasks": [ { "goal": "g1" }, { "goal": "g2" } ] }
                    }
                })),
            )
            .with_goal_latency("side", Duration::from_secs(30))
            .with_goal_latency("g1", Duration::from_secs(30))
            .with_goal_latency("g2", Duration::from_secs(30)),
        );
        let (engine, sink) = engine(fast_config(), provider);

        let mut handle = engine.submit(RunRequest::new("root")).expect("submit");
        let mut progress = handle.progress().expect("progress");
        let mut mid = None;
        let mut grandchildren = HashSet::new();
        while grandchildren.len() < 2 {
            let event = progress.recv().await.expect("progress event");
            if event.state == NodeState::Created && event.summary == "mid" {
                mid = Some(event.node_id);
            }
            if event.state == NodeState::Classifying && event.parent_id.is_some() && event.parent_id == mid {
                grandchildren.insert(event.node_id);
            }
        }
        handle.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("cancellation is prompt")
            .expect("run");
        assert_eq!(outcome.result, Err(NodeFailure::Cancelled));
        assert_eq!(outcome.tree.len(), 5);
        for id in &grandchildren {
            let node = outcome.tree.get(*id).expect("grandchild");
            assert_eq!(node.depth(), 2);
            assert_eq!(node.state(), NodeState::Failed);
            assert_eq!(node.error(), Some(&NodeFailure::Cancelled));
        }
        for node in outcome.tree.iter() {
            assert_eq!(node.error(), Some(&NodeFailure::Cancelled));
        }

        let events = sink.events().await;
        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }

    #[tokio::test]
    async fn test_verifier_failure_retries_verification_only() {
        let verdicts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&verdicts);
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "report": "composite" },
                    "plan": { "report": { "subtasks": [ { "goal": "a" }, { "goal": "b" } ] } }
                })),
            )
            .on(RequestKind::Verify, move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderFailure::timeout("verifier busy"))
                } else {
                    Ok(ProviderOutput::json(json!({ "verdict": "accept" })))
                }
            }),
        );
        let (engine, sink) = engine(fast_config(), provider.clone());

        let outcome = engine.run(RunRequest::new("report")).await.expect("run");
        assert_eq!(outcome.result.clone().expect("result").content, "done: a\ndone: b");

        let root = outcome.tree.root().expect("root");
        assert_eq!(root.state(), NodeState::Done);
        assert_eq!(root.attempt(), 2);
        assert_eq!(provider.calls_of(RequestKind::Verify).len(), 2);
        assert_eq!(provider.calls_of(RequestKind::Plan).len(), 1);
        // The pending result is verified again, not rebuilt.
        assert_eq!(provider.calls_of(RequestKind::Generate).len(), 3);

        let events = sink.events().await;
        assert!(events.iter().any(|e| e.node_id == root.id()
            && e.from == Some(NodeState::Retrying)
            && e.to == Some(NodeState::Verifying)));
        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }

    fn failing_child_provider() -> ScriptedProvider {
        ScriptedProvider::from_script(
            "script",
            script(json!({
                "classify": { "root": "composite" },
                "plan": { "root": { "subtasks": [
                    { "goal": "good" },
                    { "goal": "bad" },
                    { "goal": "after bad", "depends_on": [1] }
                ] } }
            })),
        )
        .on(RequestKind::Generate, |req| {
            if is_aggregation(req) {
                let parts: Vec<&str> = req.payload["results"]
                    .as_array()
                    .map(|r| r.iter().filter_map(|p| p["content"].as_str()).collect())
                    .unwrap_or_default();
                return Ok(ProviderOutput::text(parts.join("\n")));
            }
            match req.goal() {
                Some("bad") => Err(ProviderFailure::unrecoverable("broken tool")),
                goal => Ok(ProviderOutput::text(format!("done: {}", goal.unwrap_or_default()))),
            }
        })
    }

    #[tokio::test]
    async fn test_strict_policy_fails_parent() {
        let (engine, _) = engine(fast_config(), Arc::new(failing_child_provider()));

        let outcome = engine.run(RunRequest::new("root")).await.expect("run");
        match &outcome.result {
            Err(NodeFailure::Aggregation(reason)) => assert!(reason.contains("bad")),
            other => panic!("unexpected result: {:?}", other),
        }
        for node in outcome.tree.iter() {
            assert!(node.state().is_terminal());
        }
    }

    #[tokio::test]
    async fn test_best_effort_tolerates_failed_child() {
        let config = EngineConfig {
            partial_success_policy: PartialSuccessPolicy::BestEffort,
            ..fast_config()
        };
        let (engine, sink) = engine(config, Arc::new(failing_child_provider()));

        let outcome = engine.run(RunRequest::new("root")).await.expect("run");
        assert_eq!(outcome.result.clone().expect("result").content, "done: good");

        let bad = child_id(&outcome.tree, "bad");
        let after = outcome.tree.get(child_id(&outcome.tree, "after bad")).expect("dependent");
        assert_eq!(after.error(), Some(&NodeFailure::DependencyFailed(bad)));

        let events = sink.events().await;
        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let subtasks: Vec<_> = (0..6).map(|i| json!({ "goal": format!("part {}", i) })).collect();
        let provider = Arc::new(
            ScriptedProvider::from_script(
                "script",
                script(json!({
                    "classify": { "root": "composite" },
                    "plan": { "root": { "subtasks": subtasks } }
                })),
            )
            .with_latency(Duration::from_millis(20)),
        );
        let config = EngineConfig {
            concurrency_limit: 2,
            ..fast_config()
        };
        let (engine, _) = engine(config, provider.clone());

        let outcome = engine.run(RunRequest::new("root")).await.expect("run");
        assert!(outcome.is_success());
        assert!(provider.peak_concurrency() <= 2);
        assert_eq!(outcome.tree.len(), 7);
    }

    #[tokio::test]
    async fn test_depth_limit_forces_atomic() {
        let provider = Arc::new(ScriptedProvider::from_script(
            "script",
            script(json!({
                "classify": { "root": "composite", "x": "composite", "y": "composite" },
                "plan": { "root": { "subtasks": [ { "goal": "x" }, { "goal": "y" } ] } }
            })),
        ));
        let config = EngineConfig {
            max_depth: 1,
            ..fast_config()
        };
        let (engine, sink) = engine(config, provider.clone());

        let outcome = engine.run(RunRequest::new("root")).await.expect("run");
        assert!(outcome.is_success());
        assert_eq!(provider.calls_of(RequestKind::Classify).len(), 1);
        for node in outcome.tree.iter() {
            assert!(node.depth() <= 1);
            if node.depth() == 1 {
                assert_eq!(node.kind(), NodeKind::Atomic);
            }
        }

        let events = sink.events().await;
        let forced = events
            .iter()
            .filter(|e| e.detail.as_deref().is_some_and(|d| d.contains("forced atomic")))
            .count();
        assert_eq!(forced, 2);
    }

    #[tokio::test]
    async fn test_singleton_plan_is_a_planning_failure() {
        let provider = Arc::new(ScriptedProvider::from_script(
            "script",
            script(json!({
                "classify": { "root": "composite" },
                "plan": { "root": { "subtasks": [ { "goal": "only" } ] } }
            })),
        ));
        let config = EngineConfig {
            max_attempts: 2,
            ..fast_config()
        };
        let (engine, _) = engine(config, provider.clone());

        let outcome = engine.run(RunRequest::new("root")).await.expect("run");
        match outcome.result {
            Err(NodeFailure::AttemptsExhausted { attempts, last }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, NodeFailure::Planning(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(outcome.tree.len(), 1);
        assert_eq!(provider.calls_of(RequestKind::Classify).len(), 2);
    }

    #[tokio::test]
    async fn test_context_lines_reach_providers() {
        let provider = Arc::new(ScriptedProvider::new("p").on(RequestKind::Generate, |req| {
            Ok(ProviderOutput::text(req.context.ancestors.join("|")))
        }));
        let (engine, _) = engine(fast_config(), provider);

        let outcome = engine
            .run(RunRequest::new("answer").with_context("customer: acme"))
            .await
            .expect("run");
        assert_eq!(outcome.result.expect("result").content, "customer: acme");
    }

    #[tokio::test]
    async fn test_history_and_status() {
        let config = EngineConfig {
            history_limit: 1,
            ..fast_config()
        };
        let (engine, _) = engine(config, Arc::new(ScriptedProvider::new("p")));

        tokio_test::assert_ok!(engine.run(RunRequest::new("first")).await);
        tokio_test::assert_ok!(engine.run(RunRequest::new("second")).await);

        let history = engine.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].goal, "second");
        assert_eq!(history[0].state, NodeState::Done);
        assert_eq!(history[0].summary, "done: second");

        let status = engine.status().await;
        assert_eq!(status.runs_recorded, 1);
        assert_eq!(status.active_runs, 0);
        assert_eq!(status.last_run.map(|r| r.goal), Some("second".to_string()));
    }

    #[tokio::test]
    async fn test_empty_goal_rejected() {
        let (engine, _) = engine(fast_config(), Arc::new(ScriptedProvider::new("p")));
        assert!(matches!(
            engine.submit(RunRequest::new("   ")),
            Err(EngineError::EmptyGoal)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        let result = Engine::new(config, ProviderSet::uniform(Arc::new(ScriptedProvider::new("p"))));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_jsonl_trace_replays_to_final_states() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.jsonl");
        let sink = JsonlTraceSink::create(&path).await.expect("sink");

        let provider = Arc::new(ScriptedProvider::from_script(
            "script",
            script(json!({
                "classify": { "root": "composite" },
                "plan": { "root": { "subtasks": [ { "goal": "a" }, { "goal": "b", "depends_on": [0] } ] } }
            })),
        ));
        let engine = Engine::new(fast_config(), ProviderSet::uniform(provider))
            .expect("engine")
            .with_trace_sink(Arc::new(sink));

        let outcome = engine.run(RunRequest::new("root")).await.expect("run");
        let events = read_jsonl(&path).await.expect("read trace");
        assert!(!events.is_empty());
        assert_eq!(replay(&events).expect("replay"), outcome.tree.states());
    }
}
