//! SQLite event store implementation.

use crate::{Event, EventKind, Result, SessionId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;

/// SQLite-backed event store.
pub struct EventStore {
    conn: Connection,
}

/// Summary of one session, derived from its events.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: usize,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_session
                ON events(session_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Append an event to the store.
    pub fn append(&self, event: &Event) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, session_id, timestamp, kind, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.id.to_string(),
                event.session_id.to_string(),
                event.timestamp.to_rfc3339(),
                event_kind_name(&event.kind),
                serde_json::to_string(&event.kind)?,
            ],
        )?;
        Ok(())
    }

    /// Load all events for a session, ordered by timestamp, optionally
    /// filtered by kind name (`message`, `tool_call`, ...).
    pub fn load_events(&self, session_id: SessionId, kind: Option<&str>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, timestamp, data FROM events
             WHERE session_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY timestamp, id",
        )?;

        let events = stmt
            .query_map(params![session_id.to_string(), kind], |row| {
                let id: String = row.get(0)?;
                let session_id: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let data: String = row.get(3)?;
                Ok((id, session_id, timestamp, data))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, session_id, timestamp, data)| {
                Some(Event {
                    id: id.parse().ok()?,
                    session_id: SessionId(session_id.parse().ok()?),
                    timestamp: timestamp.parse().ok()?,
                    kind: serde_json::from_str(&data).ok()?,
                })
            })
            .collect();

        Ok(events)
    }

    /// Load all events for a session, ordered by timestamp.
    pub fn load_session(&self, session_id: SessionId) -> Result<Vec<Event>> {
        self.load_events(session_id, None)
    }

    /// List all sessions, most recent first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id,
                    MIN(timestamp),
                    MAX(CASE WHEN kind = 'session_end' THEN timestamp END),
                    SUM(CASE WHEN kind = 'message' THEN 1 ELSE 0 END)
             FROM events
             GROUP BY session_id
             ORDER BY MIN(timestamp) DESC",
        )?;

        let sessions = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let started: String = row.get(1)?;
                let ended: Option<String> = row.get(2)?;
                let messages: i64 = row.get(3)?;
                Ok((id, started, ended, messages))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(id, started, ended, messages)| {
                Some(SessionSummary {
                    id: SessionId(id.parse().ok()?),
                    started_at: started.parse().ok()?,
                    ended_at: ended.and_then(|e| e.parse().ok()),
                    message_count: messages.max(0) as usize,
                })
            })
            .collect();

        Ok(sessions)
    }
}

fn event_kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Message { .. } => "message",
        EventKind::ToolCall { .. } => "tool_call",
        EventKind::ToolResult { .. } => "tool_result",
        EventKind::TurnCompleted { .. } => "turn_completed",
        EventKind::SessionStart => "session_start",
        EventKind::SessionEnd => "session_end",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    #[test]
    fn append_and_load_round_trip() {
        let store = EventStore::in_memory().unwrap();
        let session = SessionId::new();

        store
            .append(&Event::new(session, EventKind::SessionStart))
            .unwrap();
        store
            .append(&Event::message(session, Role::User, "hello"))
            .unwrap();
        store
            .append(&Event::new(
                session,
                EventKind::ToolCall {
                    call_id: "call_1".into(),
                    name: "calculator".into(),
                    input: serde_json::json!({"expression": "2+2"}),
                    round: 0,
                },
            ))
            .unwrap();

        let events = store.load_session(session).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].kind, EventKind::SessionStart));
        assert!(matches!(
            &events[2].kind,
            EventKind::ToolCall { name, .. } if name == "calculator"
        ));
    }

    #[test]
    fn kind_filter() {
        let store = EventStore::in_memory().unwrap();
        let session = SessionId::new();

        store
            .append(&Event::message(session, Role::User, "hi"))
            .unwrap();
        store
            .append(&Event::new(
                session,
                EventKind::ToolResult {
                    call_id: "call_1".into(),
                    status: "ok".into(),
                    payload: "4".into(),
                    duration_ms: 12,
                },
            ))
            .unwrap();

        let results = store.load_events(session, Some("tool_result")).unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0].kind, EventKind::ToolResult { .. }));
    }

    #[test]
    fn session_listing_counts_messages() {
        let store = EventStore::in_memory().unwrap();
        let session = SessionId::new();

        store
            .append(&Event::new(session, EventKind::SessionStart))
            .unwrap();
        store
            .append(&Event::message(session, Role::User, "one"))
            .unwrap();
        store
            .append(&Event::message(session, Role::Assistant, "two"))
            .unwrap();

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session);
        assert_eq!(sessions[0].message_count, 2);
        assert!(sessions[0].ended_at.is_none());

        store
            .append(&Event::new(session, EventKind::SessionEnd))
            .unwrap();
        let sessions = store.list_sessions().unwrap();
        assert!(sessions[0].ended_at.is_some());
    }
}
