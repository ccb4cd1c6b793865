//! Narrow key-value document store used for persisted gate state.
//! Documents are always read and written whole.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store document is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait DocumentStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn write(&self, key: &str, document: &Value) -> Result<(), StoreError>;
}

/// One `<key>.json` file per document. A single key may also be pinned to an
/// explicit file path.
pub struct JsonFileStore {
    dir: PathBuf,
    pinned: Option<(String, PathBuf)>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pinned: None,
        }
    }

    pub fn single(key: &str, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            dir,
            pinned: Some((key.to_string(), path)),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        match &self.pinned {
            Some((pinned_key, path)) if pinned_key == key => path.clone(),
            _ => self.dir.join(format!("{key}.json")),
        }
    }
}

impl DocumentStore for JsonFileStore {
    fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Ok(None),
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, document: &Value) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so readers never see a torn document.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl DocumentStore for SqliteStore {
    fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM documents WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    fn write(&self, key: &str, document: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_string(document)?;
        self.conn.lock().execute(
            "INSERT INTO documents (key, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![key, body, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.documents.lock().get(key).cloned())
    }

    fn write(&self, key: &str, document: &Value) -> Result<(), StoreError> {
        self.documents.lock().insert(key.to_string(), document.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_path(name: &str, ext: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        PathBuf::from(format!("/tmp/pipeline-healer-tests/{name}-{nanos}.{ext}"))
    }

    fn exercise(store: &dyn DocumentStore) {
        assert_eq!(store.read("approval_state").expect("read empty"), None);
        store
            .write("approval_state", &json!({"approved": false}))
            .expect("write");
        store
            .write("approval_state", &json!({"approved": true}))
            .expect("overwrite");
        assert_eq!(
            store.read("approval_state").expect("read"),
            Some(json!({"approved": true}))
        );
    }

    #[test]
    fn memory_store_roundtrip() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn json_file_store_roundtrip() {
        let path = tmp_path("file-store", "json");
        exercise(&JsonFileStore::single("approval_state", &path));
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn json_file_store_uses_one_file_per_key() {
        let dir = tmp_path("file-store-dir", "d");
        let store = JsonFileStore::new(&dir);
        store.write("a", &json!(1)).expect("write a");
        store.write("b", &json!(2)).expect("write b");
        assert!(dir.join("a.json").exists());
        assert_eq!(store.read("b").expect("read b"), Some(json!(2)));
    }

    #[test]
    fn sqlite_store_roundtrip() {
        let store = SqliteStore::open(tmp_path("sqlite-store", "db")).expect("open");
        exercise(&store);
    }

    #[test]
    fn corrupt_file_surfaces_as_error() {
        let path = tmp_path("corrupt", "json");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        std::fs::write(&path, "{not json").expect("write");
        let store = JsonFileStore::single("approval_state", &path);
        assert!(matches!(store.read("approval_state"), Err(StoreError::Json(_))));
    }
}
