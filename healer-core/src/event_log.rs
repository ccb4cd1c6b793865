use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    FailureReceived,
    InterventionSkipped,
    DiagnosisProduced,
    FixSelected,
    FixApplied,
    FixFailed,
    FixVerified,
    FixRolledBack,
    ApprovalProposed,
    ApprovalApproved,
    ApprovalConsumed,
    StageFailed,
    FailureResolved,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    /// `<dag_id>/<task_id>`
    pub task_key: String,
    pub event_type: EventType,
    pub description: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: String,
}

impl Event {
    pub fn new(task_key: impl Into<String>, event_type: EventType, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_key: task_key.into(),
            event_type,
            description: description.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Append-only sqlite audit trail of every remediation pass.
#[derive(Clone)]
pub struct EventLog {
    db_path: Arc<PathBuf>,
}

impl EventLog {
    pub fn open(path: &str) -> Result<Self, String> {
        let db_path = PathBuf::from(path);
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
            }
        }

        let conn = Connection::open(&db_path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_key TEXT NOT NULL,
                event_type TEXT NOT NULL,
                description TEXT NOT NULL,
                details TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_key);
            CREATE INDEX IF NOT EXISTS idx_events_ts ON events(timestamp);
            ",
        )
        .map_err(|e| e.to_string())?;

        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    pub fn append(&self, event: &Event) -> Result<i64, String> {
        let conn = Connection::open(&*self.db_path).map_err(|e| e.to_string())?;
        let event_type = serde_json::to_string(&event.event_type).map_err(|e| e.to_string())?;
        let details = event
            .details
            .as_ref()
            .map(|d| serde_json::to_string(d).map_err(|e| e.to_string()))
            .transpose()?;

        conn.execute(
            "INSERT INTO events (task_key, event_type, description, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.task_key,
                event_type,
                event.description,
                details,
                event.timestamp,
            ],
        )
        .map_err(|e| e.to_string())?;

        Ok(conn.last_insert_rowid())
    }

    pub fn events_for_task(&self, task_key: &str) -> Result<Vec<Event>, String> {
        self.query(
            "SELECT id, task_key, event_type, description, details, timestamp
             FROM events
             WHERE task_key = ?1
             ORDER BY id ASC",
            params![task_key],
        )
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Event>, String> {
        let conn = Connection::open(&*self.db_path).map_err(|e| e.to_string())?;
        let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
        let rows = stmt.query_map(args, map_row).map_err(|e| e.to_string())?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| e.to_string())?);
        }
        Ok(events)
    }
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type_str: String = row.get(2)?;
    let details_str: Option<String> = row.get(4)?;

    let event_type: EventType = serde_json::from_str(&event_type_str).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
    })?;

    let details = details_str
        .map(|s| {
            serde_json::from_str(&s).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
            })
        })
        .transpose()?;

    Ok(Event {
        id: row.get(0)?,
        task_key: row.get(1)?,
        event_type,
        description: row.get(3)?,
        details,
        timestamp: row.get(5)?,
    })
}
