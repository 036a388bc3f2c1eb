//! Run context - shared state for one engine run.

use std::sync::Arc;

use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use super::types::ProgressEvent;
use crate::config::EngineConfig;
use crate::provider::ProviderSet;
use crate::task::{NodeId, NodeState};
use crate::trace::{TraceEmitter, TraceEvent};

/// Shared context passed to every component during a run.
///
/// # Thread Safety
/// Wrapped in `Arc` and cloned into worker jobs. Nothing in here is
/// mutable except through channels and the semaphore.
pub struct RunContext {
    /// Engine configuration
    pub config: Arc<EngineConfig>,

    /// Capability providers for this run
    pub providers: ProviderSet,

    /// Trace event emitter (non-blocking)
    pub trace: TraceEmitter,

    /// Root cancellation token; per-job tokens are children of it
    pub cancel_token: CancellationToken,

    /// Worker pool permits (`concurrency_limit`)
    pub permits: Arc<Semaphore>,

    /// Progress stream for UI drivers
    pub progress: broadcast::Sender<ProgressEvent>,

    /// Background lines given with the goal, passed to providers before ancestor goals
    pub background: Vec<String>,
}

impl RunContext {
    pub fn new(
        config: Arc<EngineConfig>,
        providers: ProviderSet,
        trace: TraceEmitter,
        progress: broadcast::Sender<ProgressEvent>,
        background: Vec<String>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency_limit.max(1)));
        Self {
            config,
            providers,
            trace,
            cancel_token: CancellationToken::new(),
            permits,
            progress,
            background,
        }
    }

    /// Emit a trace event. Never blocks.
    pub fn emit(&self, event: TraceEvent) -> u64 {
        self.trace.emit(event)
    }

    /// Publish a progress event. Dropped silently when nobody listens.
    pub fn emit_progress(
        &self,
        node_id: NodeId,
        parent_id: Option<NodeId>,
        state: NodeState,
        attempt: u32,
        summary: impl Into<String>,
    ) {
        let _ = self.progress.send(ProgressEvent {
            node_id,
            parent_id,
            state,
            attempt,
            summary: summary.into(),
        });
    }

    /// Context for tests: default config, one provider, no trace output.
    #[cfg(test)]
    pub(crate) fn for_tests(config: EngineConfig, provider: crate::provider::ProviderRef) -> Self {
        let (progress, _) = broadcast::channel(16);
        Self::new(
            Arc::new(config),
            ProviderSet::uniform(provider),
            TraceEmitter::disabled(),
            progress,
            Vec::new(),
        )
    }
}
