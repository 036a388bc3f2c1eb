//! Execution trace - append-only record of node transitions.
//!
//! The scheduling loop never waits on persistence: events go through an
//! unbounded channel into a [`TraceWriter`] task that feeds the configured
//! [`TraceSink`]. A sink failure is logged and the event is dropped.

mod file;
mod memory;
mod replay;
mod sqlite;

pub use file::{read_jsonl, JsonlTraceSink};
pub use memory::MemoryTraceSink;
pub use replay::{replay, ReplayError};
pub use sqlite::SqliteTraceSink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::task::{NodeId, NodeState};

/// What a trace event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// A node was added to the tree
    Created,
    /// A node changed state
    Transition,
    /// One execution attempt of an atomic node finished
    Attempt,
    /// A node was removed by a re-plan
    Discarded,
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Transition => "transition",
            Self::Attempt => "attempt",
            Self::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// One entry of the execution trace. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position in the run's trace, assigned by the emitter
    pub seq: u64,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    pub timestamp: DateTime<Utc>,
    pub kind: TraceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NodeState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NodeState>,
    pub attempt: u32,
    /// SHA-256 of the JSON payload associated with the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TraceEvent {
    fn new(node_id: NodeId, kind: TraceKind) -> Self {
        Self {
            seq: 0,
            node_id,
            parent_id: None,
            timestamp: Utc::now(),
            kind,
            from: None,
            to: None,
            attempt: 1,
            payload_digest: None,
            detail: None,
        }
    }

    pub fn created(node_id: NodeId, parent_id: Option<NodeId>) -> Self {
        let mut event = Self::new(node_id, TraceKind::Created);
        event.parent_id = parent_id;
        event.to = Some(NodeState::Created);
        event
    }

    pub fn transition(node_id: NodeId, from: NodeState, to: NodeState) -> Self {
        let mut event = Self::new(node_id, TraceKind::Transition);
        event.from = Some(from);
        event.to = Some(to);
        event
    }

    pub fn attempt(node_id: NodeId, attempt: u32) -> Self {
        Self::new(node_id, TraceKind::Attempt).with_attempt(attempt)
    }

    pub fn discarded(node_id: NodeId, parent_id: Option<NodeId>) -> Self {
        let mut event = Self::new(node_id, TraceKind::Discarded);
        event.parent_id = parent_id;
        event
    }

    pub fn with_parent(mut self, parent_id: Option<NodeId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload_digest = digest(payload);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Hex SHA-256 of the JSON encoding of `payload`.
pub fn digest<T: Serialize>(payload: &T) -> Option<String> {
    let bytes = serde_json::to_vec(payload).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt trace record: {0}")]
    Corrupt(String),

    #[error("Task join error: {0}")]
    Join(String),
}

/// Destination for trace events.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Persist one event.
    async fn append(&self, event: &TraceEvent) -> Result<(), TraceError>;

    /// Flush buffered events. Called once when a run's writer finishes.
    async fn flush(&self) -> Result<(), TraceError> {
        Ok(())
    }
}

/// Cheap, cloneable handle used by the engine to emit events.
#[derive(Clone)]
pub struct TraceEmitter {
    tx: Option<mpsc::UnboundedSender<TraceEvent>>,
    seq: Arc<AtomicU64>,
}

impl TraceEmitter {
    /// An emitter that numbers events but sends them nowhere.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stamp `event` with the next sequence number and queue it.
    ///
    /// Never blocks and never fails.
    pub fn emit(&self, mut event: TraceEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        event.seq = seq;
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("Trace writer closed; dropping event {}", seq);
            }
        }
        seq
    }
}

/// Background task draining the trace channel into a sink.
pub struct TraceWriter {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<u64>,
}

impl TraceWriter {
    /// Start a writer for `sink`.
    pub fn spawn(sink: Arc<dyn TraceSink>) -> (TraceEmitter, TraceWriter) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TraceEvent>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut written = 0u64;
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => {
                            if write_event(sink.as_ref(), &event).await {
                                written += 1;
                            }
                        }
                        None => break,
                    },
                    _ = &mut shutdown_rx => {
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            if write_event(sink.as_ref(), &event).await {
                                written += 1;
                            }
                        }
                        break;
                    }
                }
            }
            if let Err(e) = sink.flush().await {
                tracing::warn!("Failed to flush trace sink: {}", e);
            }
            written
        });

        let emitter = TraceEmitter {
            tx: Some(tx),
            seq: Arc::new(AtomicU64::new(0)),
        };
        let writer = TraceWriter {
            shutdown: Some(shutdown_tx),
            handle,
        };
        (emitter, writer)
    }

    /// Drain pending events and stop. Returns how many events were persisted.
    pub async fn finish(mut self) -> u64 {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.handle).await {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!("Trace writer task failed: {}", e);
                0
            }
        }
    }
}

async fn write_event(sink: &dyn TraceSink, event: &TraceEvent) -> bool {
    match sink.append(event).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                "Failed to persist trace event {} for node {}: {}",
                event.seq,
                event.node_id,
                e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl TraceSink for FailingSink {
        async fn append(&self, _event: &TraceEvent) -> Result<(), TraceError> {
            Err(TraceError::Corrupt("disk full".into()))
        }
    }

    #[test]
    fn test_digest_is_stable() {
        let a = digest(&serde_json::json!({ "goal": "x" }));
        let b = digest(&serde_json::json!({ "goal": "x" }));
        assert_eq!(a, b);
        assert_eq!(a.map(|d| d.len()), Some(64));
    }

    #[tokio::test]
    async fn test_writer_drains_on_finish() {
        let sink = Arc::new(MemoryTraceSink::new());
        let (emitter, writer) = TraceWriter::spawn(sink.clone());

        let node = NodeId::new();
        emitter.emit(TraceEvent::created(node, None));
        emitter.emit(TraceEvent::transition(node, NodeState::Created, NodeState::Classifying));
        assert_eq!(writer.finish().await, 2);

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);

        // Emitting after the writer stopped is harmless.
        assert_eq!(emitter.emit(TraceEvent::attempt(node, 1)), 2);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_fatal() {
        let (emitter, writer) = TraceWriter::spawn(Arc::new(FailingSink));
        emitter.emit(TraceEvent::created(NodeId::new(), None));
        assert_eq!(writer.finish().await, 0);
    }

    #[test]
    fn test_disabled_emitter_numbers_events() {
        let emitter = TraceEmitter::disabled();
        let node = NodeId::new();
        assert_eq!(emitter.emit(TraceEvent::created(node, None)), 0);
        assert_eq!(emitter.emit(TraceEvent::discarded(node, None)), 1);
    }
}
