//! Orchestrator - owns the task tree and runs the scheduling loop.
//!
//! # Responsibilities
//! 1. Keep the only mutable reference to the tree
//! 2. Move ready nodes into worker jobs, bounded by the semaphore
//! 3. Apply job results: transitions, children, retries, rejections
//! 4. Propagate failures and cancellation through the tree
//!
//! # Processing Flow
//! ```text
//! Created → Classifying ─ atomic ──→ Executing ──→ [Verifying] → Done
//!                       └ composite → Planning (children run) → Aggregating → [Verifying] → Done
//! ```
//!
//! Workers only ever see an owned [`WorkItem`] snapshot. Every tree write
//! happens here, between two `await` points of the loop, so no other task
//! can observe a half-applied update.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::queue::{QueueEntry, ReadyQueue};
use crate::agents::context::RunContext;
use crate::agents::leaf::{preview, Aggregator, Atomizer, Executor, Planner, Verifier};
use crate::agents::retry::{RetryDecision, RetryPolicy};
use crate::agents::types::{
    ChildFailure, ChildResult, EngineError, Phase, Remedy, Step, StepError, StepOutcome, Verdict,
    WorkItem,
};
use crate::config::{AggregationStrategy, PartialSuccessPolicy};
use crate::task::{
    NodeFailure, NodeId, NodeKind, NodeOutcome, NodeState, Plan, TaskOutput, TaskTree, TreeError,
};
use crate::trace::TraceEvent;

/// Requests sent to a running orchestrator.
#[derive(Debug, Clone)]
pub enum Control {
    /// Cancel a node and everything below it
    CancelNode(NodeId),
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub root_id: NodeId,
    /// The root's result, or the root's failure
    pub result: Result<TaskOutput, NodeFailure>,
    /// The whole tree, including intermediate failures
    pub tree: TaskTree,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

struct JobReport {
    job: u64,
    node_id: NodeId,
    phase: Phase,
    result: Result<StepOutcome, StepError>,
}

struct InFlight {
    job: u64,
    token: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct AggregationState {
    strategy: AggregationStrategy,
    /// The alternate strategy is tried at most once per plan
    alternate_used: bool,
}

/// Scheduler for one run.
pub struct Orchestrator {
    ctx: Arc<RunContext>,
    tree: TaskTree,
    root_id: NodeId,
    queue: ReadyQueue,
    jobs: JoinSet<JobReport>,
    in_flight: HashMap<NodeId, InFlight>,
    next_job: u64,
    aggregation: HashMap<NodeId, AggregationState>,
    /// Results waiting for the verifier
    pending_output: HashMap<NodeId, TaskOutput>,
    retry: RetryPolicy,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh tree rooted at `goal`.
    ///
    /// Returns the sender used to cancel individual nodes while it runs.
    pub fn new(
        ctx: Arc<RunContext>,
        goal: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedSender<Control>), EngineError> {
        let mut tree = TaskTree::new(ctx.config.max_depth);
        let root_id = tree.insert_root(goal)?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let retry = RetryPolicy::from_config(&ctx.config);

        let orchestrator = Self {
            ctx,
            tree,
            root_id,
            queue: ReadyQueue::new(),
            jobs: JoinSet::new(),
            in_flight: HashMap::new(),
            next_job: 0,
            aggregation: HashMap::new(),
            pending_output: HashMap::new(),
            retry,
            control_rx,
        };
        Ok((orchestrator, control_tx))
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    /// Drive the tree until the root is terminal.
    pub async fn run(mut self) -> Result<RunOutcome, EngineError> {
        let started = std::time::Instant::now();
        let root_id = self.root_id;
        let root_token = self.ctx.cancel_token.clone();
        let mut cancel_seen = false;

        tracing::info!(
            "Starting run {}: {}",
            root_id,
            self.tree.root().map(|r| preview(r.goal())).unwrap_or_default()
        );
        self.record_created(root_id, None);
        self.start(root_id)?;

        while !self.is_terminal(root_id) {
            self.dispatch_ready()?;

            let wake = self.queue.next_wake();
            if self.jobs.is_empty() && wake.is_none() && !self.queue.has_ready() {
                tracing::error!("Scheduler stalled with run {} unfinished", root_id);
                self.fail_and_settle(
                    root_id,
                    NodeFailure::Execution {
                        transient: false,
                        reason: "scheduler stalled: no runnable nodes".to_string(),
                    },
                )?;
                break;
            }

            tokio::select! {
                biased;

                _ = root_token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    tracing::info!("Run {} cancelled", root_id);
                    self.cancel_node(root_id)?;
                }

                Some(control) = self.control_rx.recv() => match control {
                    Control::CancelNode(id) => self.cancel_node(id)?,
                },

                Some(joined) = self.jobs.join_next() => match joined {
                    Ok(report) => self.on_report(report)?,
                    Err(e) => tracing::error!("Worker job failed to join: {}", e),
                },

                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
            }
        }

        for (_, flight) in self.in_flight.drain() {
            flight.token.cancel();
        }
        self.jobs.shutdown().await;

        let result = match self.tree.get(root_id).and_then(|r| r.outcome()) {
            Some(NodeOutcome::Success(output)) => Ok(output.clone()),
            Some(NodeOutcome::Failure(failure)) => Err(failure.clone()),
            None => return Err(EngineError::Internal(format!("run {} ended without an outcome", root_id))),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => tracing::info!("Run {} finished in {:?} ({} nodes)", root_id, elapsed, self.tree.len()),
            Err(e) => tracing::warn!("Run {} failed after {:?}: {}", root_id, elapsed, e),
        }

        Ok(RunOutcome {
            root_id,
            result,
            tree: self.tree,
            elapsed,
        })
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    fn dispatch_ready(&mut self) -> Result<(), EngineError> {
        self.queue.promote(Instant::now());
        while self.queue.has_ready() {
            let Ok(permit) = Arc::clone(&self.ctx.permits).try_acquire_owned() else {
                break;
            };
            let Some(entry) = self.queue.pop() else {
                break;
            };
            self.dispatch(entry, permit)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, entry: QueueEntry, permit: OwnedSemaphorePermit) -> Result<(), EngineError> {
        let id = entry.node_id;
        let Some(node) = self.tree.get(id) else {
            return Ok(());
        };
        let state = node.state();
        if state.is_terminal() || self.in_flight.contains_key(&id) {
            return Ok(());
        }

        let target = entry.phase.state();
        if state == NodeState::Retrying {
            self.move_to(id, target, None)?;
        } else if state != target {
            tracing::debug!("Dropping stale {} entry for node {} in state {}", entry.phase, id, state);
            return Ok(());
        }

        let item = self.snapshot(id)?;
        let step = self.build_step(id, entry.phase)?;
        let token = self.ctx.cancel_token.child_token();
        let job = self.next_job;
        self.next_job += 1;

        tracing::debug!("Dispatching {} for node {} (attempt {})", entry.phase, id, item.attempt);
        self.in_flight.insert(
            id,
            InFlight {
                job,
                token: token.clone(),
            },
        );
        self.jobs
            .spawn(run_job(Arc::clone(&self.ctx), job, item, step, token, permit));
        Ok(())
    }

    fn snapshot(&self, id: NodeId) -> Result<WorkItem, EngineError> {
        let node = self.tree.get(id).ok_or(TreeError::NodeNotFound(id))?;
        let mut ancestors = self.ctx.background.clone();
        ancestors.extend(self.tree.ancestor_goals(id));

        Ok(WorkItem {
            node_id: id,
            parent_id: node.parent_id(),
            goal: node.goal().to_string(),
            kind: node.kind(),
            hint: node.provider_hint(),
            depth: node.depth(),
            attempt: node.attempt(),
            ancestors,
            inputs: self.tree.dependency_results(id),
        })
    }

    fn build_step(&self, id: NodeId, phase: Phase) -> Result<Step, EngineError> {
        Ok(match phase {
            Phase::Classify => Step::Classify,
            Phase::Plan => Step::Plan,
            Phase::Execute => Step::Execute,
            Phase::Aggregate => {
                let node = self.tree.get(id).ok_or(TreeError::NodeNotFound(id))?;
                let mut results = Vec::new();
                let mut failures = Vec::new();
                for child in self.tree.children(id) {
                    match child.outcome() {
                        Some(NodeOutcome::Success(output)) => results.push(ChildResult {
                            index: child.index(),
                            goal: child.goal().to_string(),
                            output: output.clone(),
                        }),
                        Some(NodeOutcome::Failure(error)) => failures.push(ChildFailure {
                            index: child.index(),
                            goal: child.goal().to_string(),
                            error: error.clone(),
                        }),
                        None => {}
                    }
                }
                Step::Aggregate {
                    strategy: self.aggregation_state(id).strategy,
                    ordered: node.ordered_children(),
                    results,
                    failures,
                }
            }
            Phase::Verify => Step::Verify {
                output: self.pending_output.get(&id).cloned().ok_or_else(|| {
                    EngineError::Internal(format!("no result waiting for verification on {}", id))
                })?,
            },
        })
    }

    // ---------------------------------------------------------------------
    // Job results
    // ---------------------------------------------------------------------

    fn on_report(&mut self, report: JobReport) -> Result<(), EngineError> {
        let current = self
            .in_flight
            .get(&report.node_id)
            .is_some_and(|flight| flight.job == report.job);
        if !current {
            tracing::debug!("Ignoring stale {} report for node {}", report.phase, report.node_id);
            return Ok(());
        }
        self.in_flight.remove(&report.node_id);

        let id = report.node_id;
        match self.tree.get(id).map(|n| n.state()) {
            Some(state) if state == report.phase.state() => {}
            _ => return Ok(()),
        }

        match report.result {
            Ok(outcome) => self.apply(id, outcome),
            Err(error) => self.retry_or_fail(id, report.phase, error),
        }
    }

    fn apply(&mut self, id: NodeId, outcome: StepOutcome) -> Result<(), EngineError> {
        match outcome {
            StepOutcome::Classified(classification) => {
                if let Some(node) = self.tree.get_mut(id) {
                    node.classify_as(classification.kind, classification.hint);
                }
                let detail = classification.forced.then(|| {
                    tracing::info!(
                        "Node {} reached the depth limit ({}); forcing atomic",
                        id,
                        self.ctx.config.max_depth
                    );
                    format!("depth limit {} reached, forced atomic", self.ctx.config.max_depth)
                });
                match classification.kind {
                    NodeKind::Composite => {
                        self.move_to(id, NodeState::Planning, detail)?;
                        self.enqueue(id, Phase::Plan, Duration::ZERO);
                    }
                    NodeKind::Atomic | NodeKind::Unclassified => {
                        self.move_to(id, NodeState::Executing, detail)?;
                        self.enqueue(id, Phase::Execute, Duration::ZERO);
                    }
                }
                Ok(())
            }
            StepOutcome::Planned(plan) => self.expand(id, plan),
            StepOutcome::Executed(output) => self.produced(id, NodeKind::Atomic, output),
            StepOutcome::Aggregated(output) => self.produced(id, NodeKind::Composite, output),
            StepOutcome::Verified(Verdict::Accept) => {
                let output = self.pending_output.remove(&id).ok_or_else(|| {
                    EngineError::Internal(format!("verified node {} has no pending result", id))
                })?;
                self.complete(id, output)
            }
            StepOutcome::Verified(Verdict::Reject { reason, remedy }) => {
                self.handle_rejection(id, reason, remedy)
            }
        }
    }

    /// Materialize a plan and start the children whose dependencies are met.
    fn expand(&mut self, id: NodeId, plan: Plan) -> Result<(), EngineError> {
        let children = match self.tree.add_children(id, &plan) {
            Ok(children) => children,
            Err(e) => return self.fail_and_settle(id, NodeFailure::Planning(e.to_string())),
        };

        tracing::info!(
            "Node {} decomposed into {} children: {}",
            id,
            children.len(),
            plan.reasoning()
        );
        self.aggregation.insert(
            id,
            AggregationState {
                strategy: self.ctx.config.aggregation_strategy,
                alternate_used: false,
            },
        );

        let reasoning = Some(plan.reasoning()).filter(|r| !r.is_empty());
        for child in &children {
            self.record_created(*child, reasoning);
        }
        for child in children {
            if self.tree.dependencies_met(child) {
                self.start(child)?;
            }
        }
        Ok(())
    }

    /// A result was produced; verify it or finish the node.
    fn produced(&mut self, id: NodeId, kind: NodeKind, output: TaskOutput) -> Result<(), EngineError> {
        let depth = self.tree.get(id).map(|n| n.depth()).unwrap_or_default();
        if self.ctx.config.should_verify(kind, depth) {
            self.pending_output.insert(id, output);
            self.move_to(id, NodeState::Verifying, None)?;
            self.enqueue(id, Phase::Verify, Duration::ZERO);
            Ok(())
        } else {
            self.complete(id, output)
        }
    }

    fn retry_or_fail(&mut self, id: NodeId, phase: Phase, error: StepError) -> Result<(), EngineError> {
        let attempt = self.tree.get(id).map(|n| n.attempt()).unwrap_or(1);
        match self.retry.decide(attempt, &error) {
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    "Node {} failed to {} on attempt {}: {}; retrying in {:?}",
                    id,
                    phase,
                    attempt,
                    error,
                    delay
                );
                self.schedule_retry(id, phase.retry_phase(), delay, error.to_string())
            }
            RetryDecision::GiveUp(failure) => {
                if !failure.is_cancelled() {
                    tracing::warn!("Node {} failed to {}: {}", id, phase, failure);
                }
                self.fail_and_settle(id, failure)
            }
        }
    }

    fn handle_rejection(&mut self, id: NodeId, reason: String, remedy: Remedy) -> Result<(), EngineError> {
        self.pending_output.remove(&id);
        let Some(node) = self.tree.get(id) else {
            return Ok(());
        };
        let attempt = node.attempt();
        let kind = node.kind();

        if !self.retry.has_budget(attempt) {
            tracing::warn!("Node {} rejected with no attempts left: {}", id, reason);
            let failure = self
                .retry
                .exhausted(attempt, NodeFailure::VerificationRejected(reason));
            return self.fail_and_settle(id, failure);
        }

        if kind != NodeKind::Composite {
            tracing::info!("Node {} rejected, executing again: {}", id, reason);
            return self.schedule_retry(id, Phase::Execute, Duration::ZERO, format!("rejected: {}", reason));
        }

        let mut state = self.aggregation_state(id);
        if remedy == Remedy::Retry && !state.alternate_used {
            state.alternate_used = true;
            state.strategy = state.strategy.alternate();
            self.aggregation.insert(id, state);
            tracing::info!(
                "Node {} rejected, aggregating again with {:?}: {}",
                id,
                state.strategy,
                reason
            );
            return self.schedule_retry(id, Phase::Aggregate, Duration::ZERO, format!("rejected: {}", reason));
        }

        tracing::info!("Node {} rejected, re-planning: {}", id, reason);
        self.discard_children(id);
        self.schedule_retry(
            id,
            Phase::Plan,
            Duration::ZERO,
            format!("rejected, re-planning: {}", reason),
        )
    }

    // ---------------------------------------------------------------------
    // Tree updates
    // ---------------------------------------------------------------------

    fn start(&mut self, id: NodeId) -> Result<(), EngineError> {
        self.move_to(id, NodeState::Classifying, None)?;
        self.enqueue(id, Phase::Classify, Duration::ZERO);
        Ok(())
    }

    fn enqueue(&mut self, id: NodeId, phase: Phase, delay: Duration) {
        let depth = self.tree.get(id).map(|n| n.depth()).unwrap_or_default();
        self.queue.push_after(id, phase, depth, delay);
    }

    fn schedule_retry(
        &mut self,
        id: NodeId,
        phase: Phase,
        delay: Duration,
        reason: String,
    ) -> Result<(), EngineError> {
        let prev = self.tree.transition(id, NodeState::Retrying)?;
        if let Some(node) = self.tree.get_mut(id) {
            node.next_attempt();
        }
        self.record_transition(id, prev, NodeState::Retrying, Some(reason));
        self.enqueue(id, phase, delay);
        Ok(())
    }

    fn complete(&mut self, id: NodeId, output: TaskOutput) -> Result<(), EngineError> {
        let summary = preview(&output.content);
        let prev = self.tree.complete(id, output)?;
        self.record_transition(id, prev, NodeState::Done, Some(summary));
        self.settle(id)
    }

    fn fail_and_settle(&mut self, id: NodeId, failure: NodeFailure) -> Result<(), EngineError> {
        self.mark_failed(id, failure)?;
        self.settle(id)
    }

    /// Fail `id` after cancelling its unfinished descendants.
    ///
    /// Descendants are not settled: their parent is failing anyway.
    fn mark_failed(&mut self, id: NodeId, failure: NodeFailure) -> Result<(), EngineError> {
        for descendant in self.tree.descendants(id) {
            if !self.is_terminal(descendant) {
                self.fail_one(descendant, NodeFailure::Cancelled)?;
            }
        }
        self.fail_one(id, failure)
    }

    fn fail_one(&mut self, id: NodeId, failure: NodeFailure) -> Result<(), EngineError> {
        self.stop_work(id);
        let detail = failure.to_string();
        let prev = self.tree.fail(id, failure)?;
        self.record_transition(id, prev, NodeState::Failed, Some(detail));
        Ok(())
    }

    /// Abandon queued and in-flight work for `id`.
    fn stop_work(&mut self, id: NodeId) {
        if let Some(flight) = self.in_flight.remove(&id) {
            flight.token.cancel();
        }
        self.queue.remove(id);
        self.pending_output.remove(&id);
    }

    fn cancel_node(&mut self, id: NodeId) -> Result<(), EngineError> {
        match self.tree.get(id) {
            None => {
                tracing::warn!("Cannot cancel unknown node {}", id);
                Ok(())
            }
            Some(node) if node.state().is_terminal() => Ok(()),
            Some(_) => {
                tracing::info!("Cancelling node {} and its subtree", id);
                self.fail_and_settle(id, NodeFailure::Cancelled)
            }
        }
    }

    /// Remove the children of a composite for a re-plan.
    fn discard_children(&mut self, id: NodeId) {
        let doomed: Vec<(NodeId, Option<NodeId>)> = self
            .tree
            .descendants(id)
            .into_iter()
            .map(|d| (d, self.tree.get(d).and_then(|n| n.parent_id())))
            .collect();

        self.tree.discard_children(id);
        for (node_id, parent_id) in doomed {
            self.stop_work(node_id);
            self.aggregation.remove(&node_id);
            self.ctx.emit(TraceEvent::discarded(node_id, parent_id));
        }
    }

    /// Propagate a terminal node to its parent: unblock or fail dependents,
    /// apply the partial-success policy, and start aggregation once every
    /// child is terminal.
    fn settle(&mut self, start: NodeId) -> Result<(), EngineError> {
        let mut pending = VecDeque::from([start]);

        while let Some(id) = pending.pop_front() {
            let Some(node) = self.tree.get(id) else {
                continue;
            };
            let Some(parent_id) = node.parent_id() else {
                continue;
            };
            let state = node.state();
            let failure = node.error().cloned();
            let goal = node.goal().to_string();

            let parent_waiting = self
                .tree
                .get(parent_id)
                .is_some_and(|p| p.state() == NodeState::Planning);
            if !parent_waiting {
                continue;
            }

            match state {
                NodeState::Done => {
                    for dependent in self.tree.dependents(id) {
                        let created = self
                            .tree
                            .get(dependent)
                            .is_some_and(|n| n.state() == NodeState::Created);
                        if created && self.tree.dependencies_met(dependent) {
                            self.start(dependent)?;
                        }
                    }
                }
                NodeState::Failed => {
                    let failure = failure.unwrap_or(NodeFailure::Cancelled);
                    match self.ctx.config.partial_success_policy {
                        PartialSuccessPolicy::Strict => {
                            tracing::warn!("Child '{}' of {} failed; failing parent", goal, parent_id);
                            self.mark_failed(
                                parent_id,
                                NodeFailure::Aggregation(format!(
                                    "required child '{}' failed: {}",
                                    goal, failure
                                )),
                            )?;
                            pending.push_back(parent_id);
                            continue;
                        }
                        PartialSuccessPolicy::BestEffort => {
                            for dependent in self.tree.dependents(id) {
                                let created = self
                                    .tree
                                    .get(dependent)
                                    .is_some_and(|n| n.state() == NodeState::Created);
                                if created {
                                    self.mark_failed(dependent, NodeFailure::DependencyFailed(id))?;
                                    pending.push_back(dependent);
                                }
                            }
                        }
                    }
                }
                _ => continue,
            }

            let all_terminal = self
                .tree
                .children(parent_id)
                .iter()
                .all(|c| c.state().is_terminal());
            if all_terminal {
                if let Some(failed) = self.begin_aggregation(parent_id)? {
                    pending.push_back(failed);
                }
            }
        }
        Ok(())
    }

    /// Move a composite whose children are all terminal to `Aggregating`.
    ///
    /// Returns the parent id if it failed instead.
    fn begin_aggregation(&mut self, id: NodeId) -> Result<Option<NodeId>, EngineError> {
        let children = self.tree.children(id);
        let total = children.len();
        let succeeded = children
            .iter()
            .filter(|c| c.state() == NodeState::Done)
            .count();

        if succeeded < total && self.ctx.config.partial_success_policy == PartialSuccessPolicy::Strict {
            self.mark_failed(
                id,
                NodeFailure::Aggregation(format!("{} of {} children failed", total - succeeded, total)),
            )?;
            return Ok(Some(id));
        }
        if succeeded == 0 {
            self.mark_failed(
                id,
                NodeFailure::Aggregation(format!("none of {} children succeeded", total)),
            )?;
            return Ok(Some(id));
        }

        self.move_to(
            id,
            NodeState::Aggregating,
            Some(format!("{} of {} children succeeded", succeeded, total)),
        )?;
        self.enqueue(id, Phase::Aggregate, Duration::ZERO);
        Ok(None)
    }

    fn move_to(&mut self, id: NodeId, next: NodeState, detail: Option<String>) -> Result<(), EngineError> {
        let prev = self.tree.transition(id, next)?;
        self.record_transition(id, prev, next, detail);
        Ok(())
    }

    fn aggregation_state(&self, id: NodeId) -> AggregationState {
        self.aggregation.get(&id).copied().unwrap_or(AggregationState {
            strategy: self.ctx.config.aggregation_strategy,
            alternate_used: false,
        })
    }

    fn is_terminal(&self, id: NodeId) -> bool {
        self.tree.get(id).map_or(true, |n| n.state().is_terminal())
    }

    // ---------------------------------------------------------------------
    // Trace and progress
    // ---------------------------------------------------------------------

    /// Children carry their plan's reasoning as the event detail.
    fn record_created(&self, id: NodeId, reasoning: Option<&str>) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        let mut event = TraceEvent::created(id, node.parent_id()).with_payload(&serde_json::json!({
            "goal": node.goal(),
            "depth": node.depth(),
            "depends_on": node.depends_on(),
        }));
        if let Some(reasoning) = reasoning {
            event = event.with_detail(reasoning);
        }
        self.ctx.emit(event);
        self.ctx.emit_progress(
            id,
            node.parent_id(),
            NodeState::Created,
            node.attempt(),
            preview(node.goal()),
        );
    }

    fn record_transition(&self, id: NodeId, from: NodeState, to: NodeState, detail: Option<String>) {
        let Some(node) = self.tree.get(id) else {
            return;
        };

        let mut event = TraceEvent::transition(id, from, to)
            .with_parent(node.parent_id())
            .with_attempt(node.attempt());
        match node.outcome() {
            Some(NodeOutcome::Success(output)) if to == NodeState::Done => {
                event = event.with_payload(output);
            }
            Some(NodeOutcome::Failure(failure)) if to == NodeState::Failed => {
                event = event.with_payload(failure);
            }
            _ => {}
        }
        if let Some(detail) = &detail {
            event = event.with_detail(detail.clone());
        }
        self.ctx.emit(event);

        tracing::debug!("Node {} {} -> {} (attempt {})", id, from, to, node.attempt());
        self.ctx.emit_progress(
            id,
            node.parent_id(),
            to,
            node.attempt(),
            detail.unwrap_or_else(|| to.to_string()),
        );
    }
}

// -------------------------------------------------------------------------
// Worker jobs
// -------------------------------------------------------------------------

async fn run_job(
    ctx: Arc<RunContext>,
    job: u64,
    item: WorkItem,
    step: Step,
    token: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> JobReport {
    let phase = step.phase();
    let node_id = item.node_id;

    let result = match AssertUnwindSafe(perform(&ctx, &item, step, &token))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Worker for node {} panicked during {}: {}", node_id, phase, reason);
            Err(StepError::fatal(NodeFailure::Execution {
                transient: false,
                reason: format!("worker panicked: {}", reason),
            }))
        }
    };

    JobReport {
        job,
        node_id,
        phase,
        result,
    }
}

async fn perform(
    ctx: &RunContext,
    item: &WorkItem,
    step: Step,
    token: &CancellationToken,
) -> Result<StepOutcome, StepError> {
    if token.is_cancelled() {
        return Err(StepError::cancelled());
    }

    match step {
        Step::Classify => Atomizer::new()
            .classify(item, ctx, token)
            .await
            .map(StepOutcome::Classified),
        Step::Plan => Planner::new()
            .decompose(item, ctx, token)
            .await
            .map(StepOutcome::Planned),
        Step::Execute => Executor::new()
            .execute(item, ctx, token)
            .await
            .map(StepOutcome::Executed),
        Step::Aggregate {
            strategy,
            ordered,
            results,
            failures,
        } => Aggregator::new()
            .aggregate(item, strategy, ordered, results, failures, ctx, token)
            .await
            .map(StepOutcome::Aggregated),
        Step::Verify { output } => Verifier::new()
            .verify(item, &output, ctx, token)
            .await
            .map(StepOutcome::Verified),
    }
}
