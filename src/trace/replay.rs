//! Rebuild final node states from a trace.

use std::collections::BTreeMap;

use super::{TraceEvent, TraceKind};
use crate::task::{NodeId, NodeState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("Event {seq} refers to unknown node {node}")]
    UnknownNode { seq: u64, node: NodeId },

    #[error("Event {seq} creates node {node} twice")]
    DuplicateCreation { seq: u64, node: NodeId },

    #[error("Event {seq} moves {node} from {found} but the node is {expected}")]
    StateMismatch {
        seq: u64,
        node: NodeId,
        expected: NodeState,
        found: NodeState,
    },

    #[error("Event {seq} is a transition without a target state")]
    MissingTarget { seq: u64 },
}

/// Fold a trace into the final state of every node still in the tree.
///
/// Events are applied in `seq` order regardless of input order. Nodes
/// discarded by a re-plan are not part of the result.
pub fn replay(events: &[TraceEvent]) -> Result<BTreeMap<NodeId, NodeState>, ReplayError> {
    let mut ordered: Vec<&TraceEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.seq);

    let mut states = BTreeMap::new();
    for event in ordered {
        let seq = event.seq;
        let node = event.node_id;
        match event.kind {
            TraceKind::Created => {
                if states.insert(node, NodeState::Created).is_some() {
                    return Err(ReplayError::DuplicateCreation { seq, node });
                }
            }
            TraceKind::Transition => {
                let current = states
                    .get_mut(&node)
                    .ok_or(ReplayError::UnknownNode { seq, node })?;
                if let Some(from) = event.from {
                    if from != *current {
                        return Err(ReplayError::StateMismatch {
                            seq,
                            node,
                            expected: *current,
                            found: from,
                        });
                    }
                }
                *current = event.to.ok_or(ReplayError::MissingTarget { seq })?;
            }
            TraceKind::Attempt => {
                if !states.contains_key(&node) {
                    return Err(ReplayError::UnknownNode { seq, node });
                }
            }
            TraceKind::Discarded => {
                if states.remove(&node).is_none() {
                    return Err(ReplayError::UnknownNode { seq, node });
                }
            }
        }
    }
    Ok(states)
}
