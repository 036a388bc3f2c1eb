//! In-memory trace sink.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{TraceError, TraceEvent, TraceSink};

/// Keeps every event in memory. Used by tests and short-lived runs.
#[derive(Default)]
pub struct MemoryTraceSink {
    events: RwLock<Vec<TraceEvent>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events appended so far, in append order.
    pub async fn events(&self) -> Vec<TraceEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn append(&self, event: &TraceEvent) -> Result<(), TraceError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}
