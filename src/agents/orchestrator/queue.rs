//! Ready queue for the scheduling loop.
//!
//! Entries are ordered deeper-first (depth-first expansion), then FIFO.
//! Retries wait in a separate delay heap until their backoff expires.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

use crate::agents::types::Phase;
use crate::task::NodeId;

/// A node waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub node_id: NodeId,
    pub phase: Phase,
    pub depth: u32,
    seq: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth
            .cmp(&other.depth)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    entry: QueueEntry,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    ready: BinaryHeap<QueueEntry>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a node for immediate dispatch.
    pub fn push(&mut self, node_id: NodeId, phase: Phase, depth: u32) {
        let entry = self.entry(node_id, phase, depth);
        self.ready.push(entry);
    }

    /// Queue a node to become ready after `delay`.
    pub fn push_after(&mut self, node_id: NodeId, phase: Phase, depth: u32, delay: Duration) {
        if delay.is_zero() {
            return self.push(node_id, phase, depth);
        }
        let entry = self.entry(node_id, phase, depth);
        self.delayed.push(Reverse(Delayed {
            ready_at: Instant::now() + delay,
            entry,
        }));
    }

    /// Move every delayed entry whose backoff expired into the ready heap.
    pub fn promote(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.ready_at > now {
                break;
            }
            if let Some(Reverse(delayed)) = self.delayed.pop() {
                self.ready.push(delayed.entry);
            }
        }
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.ready.pop()
    }

    /// When the earliest delayed entry becomes ready.
    pub fn next_wake(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(d)| d.ready_at)
    }

    /// Drop every entry for `node_id`.
    pub fn remove(&mut self, node_id: NodeId) {
        self.ready.retain(|e| e.node_id != node_id);
        self.delayed.retain(|Reverse(d)| d.entry.node_id != node_id);
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    fn entry(&mut self, node_id: NodeId, phase: Phase, depth: u32) -> QueueEntry {
        let seq = self.next_seq;
        self.next_seq += 1;
        QueueEntry {
            node_id,
            phase,
            depth,
            seq,
        }
    }
}
