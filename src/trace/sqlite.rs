//! SQLite-based trace sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use super::{TraceError, TraceEvent, TraceKind, TraceSink};
use crate::task::{NodeId, NodeState};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS trace_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seq INTEGER NOT NULL,
    node_id TEXT NOT NULL,
    parent_id TEXT,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT,
    attempt INTEGER NOT NULL,
    payload_digest TEXT,
    detail TEXT
);

CREATE INDEX IF NOT EXISTS idx_trace_events_seq ON trace_events(seq);
CREATE INDEX IF NOT EXISTS idx_trace_events_node ON trace_events(node_id, seq);
"#;

/// Stores trace events in a `trace_events` table.
pub struct SqliteTraceSink {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteTraceSink {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, TraceError>(conn)
        })
        .await
        .map_err(|e| TraceError::Join(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// A private in-memory database.
    pub fn in_memory() -> Result<Self, TraceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All stored events ordered by sequence number.
    pub async fn events(&self) -> Result<Vec<TraceEvent>, TraceError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT seq, node_id, parent_id, timestamp, kind, from_state, to_state, attempt, payload_digest, detail
                 FROM trace_events
                 ORDER BY seq ASC, id ASC",
            )?;

            let rows = stmt.query_map([], |row| {
                Ok(RawRow {
                    seq: row.get(0)?,
                    node_id: row.get(1)?,
                    parent_id: row.get(2)?,
                    timestamp: row.get(3)?,
                    kind: row.get(4)?,
                    from_state: row.get(5)?,
                    to_state: row.get(6)?,
                    attempt: row.get(7)?,
                    payload_digest: row.get(8)?,
                    detail: row.get(9)?,
                })
            })?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row?.into_event()?);
            }
            Ok::<_, TraceError>(events)
        })
        .await
        .map_err(|e| TraceError::Join(e.to_string()))?
    }
}

#[async_trait]
impl TraceSink for SqliteTraceSink {
    async fn append(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let conn = self.conn.clone();
        let event = event.clone();
        let kind = enum_text(&event.kind)?;
        let from_state = event.from.as_ref().map(enum_text).transpose()?;
        let to_state = event.to.as_ref().map(enum_text).transpose()?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO trace_events (seq, node_id, parent_id, timestamp, kind, from_state, to_state, attempt, payload_digest, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.seq as i64,
                    event.node_id.to_string(),
                    event.parent_id.map(|p| p.to_string()),
                    event.timestamp.to_rfc3339(),
                    kind,
                    from_state,
                    to_state,
                    event.attempt as i64,
                    event.payload_digest,
                    event.detail,
                ],
            )?;
            Ok::<_, TraceError>(())
        })
        .await
        .map_err(|e| TraceError::Join(e.to_string()))?
    }
}

struct RawRow {
    seq: i64,
    node_id: String,
    parent_id: Option<String>,
    timestamp: String,
    kind: String,
    from_state: Option<String>,
    to_state: Option<String>,
    attempt: i64,
    payload_digest: Option<String>,
    detail: Option<String>,
}

impl RawRow {
    fn into_event(self) -> Result<TraceEvent, TraceError> {
        Ok(TraceEvent {
            seq: self.seq as u64,
            node_id: parse_id(&self.node_id)?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map_err(|e| TraceError::Corrupt(format!("timestamp '{}': {}", self.timestamp, e)))?
                .with_timezone(&Utc),
            kind: parse_enum::<TraceKind>(&self.kind)?,
            from: self.from_state.as_deref().map(parse_enum::<NodeState>).transpose()?,
            to: self.to_state.as_deref().map(parse_enum::<NodeState>).transpose()?,
            attempt: self.attempt as u32,
            payload_digest: self.payload_digest,
            detail: self.detail,
        })
    }
}

fn parse_id(text: &str) -> Result<NodeId, TraceError> {
    text.parse()
        .map_err(|e| TraceError::Corrupt(format!("node id '{}': {}", text, e)))
}

/// Serde name of a unit enum variant ("transition", "executing", ...).
fn enum_text<T: Serialize>(value: &T) -> Result<String, TraceError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(TraceError::Corrupt(format!("expected a string variant, got {}", other))),
    }
}

fn parse_enum<T: DeserializeOwned>(text: &str) -> Result<T, TraceError> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|e| TraceError::Corrupt(format!("'{}': {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<TraceEvent> {
        let root = NodeId::new();
        let child = NodeId::new();
        let mut events = vec![
            TraceEvent::created(root, None),
            TraceEvent::transition(root, NodeState::Created, NodeState::Classifying),
            TraceEvent::created(child, Some(root)),
            TraceEvent::attempt(child, 2).with_detail("rate limited"),
        ];
        for (seq, event) in events.iter_mut().enumerate() {
            event.seq = seq as u64;
        }
        events
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let sink = SqliteTraceSink::in_memory().expect("open");
        let events = sample();
        // Insert out of order; reads come back ordered by seq.
        for event in events.iter().rev() {
            sink.append(event).await.expect("append");
        }

        let stored = sink.events().await.expect("events");
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[1].to, Some(NodeState::Classifying));
        assert_eq!(stored[2].parent_id, Some(events[0].node_id));
        assert_eq!(stored[3].kind, TraceKind::Attempt);
        assert_eq!(stored[3].attempt, 2);
        assert_eq!(stored[3].detail.as_deref(), Some("rate limited"));
        assert_eq!(stored[0].timestamp, events[0].timestamp);
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trace.db");

        {
            let sink = SqliteTraceSink::open(&path).await.expect("open");
            for event in sample() {
                sink.append(&event).await.expect("append");
            }
        }

        let reopened = SqliteTraceSink::open(&path).await.expect("reopen");
        assert_eq!(reopened.events().await.expect("events").len(), 4);
    }
}
