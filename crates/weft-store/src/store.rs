use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::PersistencePort;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS flows (
        key TEXT PRIMARY KEY,
        document TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

/// SQLite-backed flow store. Each flow document lives under its own key.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    key: String,
}

/// Summary of one stored flow.
#[derive(Debug, Clone)]
pub struct StoredFlow {
    pub key: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub bytes: usize,
}

fn db_err(e: impl std::fmt::Display) -> WeftError {
    WeftError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path, reading and
    /// writing the document stored under `key`.
    pub fn open(path: &Path, key: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WeftError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            key: key.into(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(key: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: key.into(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Every stored flow, most recently updated first.
    pub fn list(&self) -> Result<Vec<StoredFlow>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT key, updated_at, length(document) FROM flows
                 ORDER BY updated_at DESC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let ts_str: String = row.get(1)?;
                let bytes: i64 = row.get(2)?;
                Ok((key, ts_str, bytes))
            })
            .map_err(db_err)?;

        let mut flows = Vec::new();
        for row in rows {
            let (key, ts_str, bytes) = row.map_err(db_err)?;
            flows.push(StoredFlow {
                key,
                updated_at: DateTime::parse_from_rfc3339(&ts_str)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc)),
                bytes: bytes.max(0) as usize,
            });
        }
        Ok(flows)
    }

    /// Delete the document under this store's key. Returns whether one existed.
    pub fn clear(&self) -> Result<bool> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n = conn
            .execute("DELETE FROM flows WHERE key = ?1", params![self.key])
            .map_err(db_err)?;
        Ok(n > 0)
    }
}

impl PersistencePort for SqliteStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.query_row(
                "SELECT document FROM flows WHERE key = ?1",
                params![self.key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)
        })
    }

    fn save(&self, document: &str) -> BoxFuture<'_, Result<()>> {
        let document = document.to_string();
        let updated_at = Utc::now().to_rfc3339();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO flows (key, document, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET document = excluded.document,
                                                updated_at = excluded.updated_at",
                params![self.key, document, updated_at],
            )
            .map_err(db_err)?;
            debug!(key = %self.key, bytes = document.len(), "Flow saved");
            Ok(())
        })
    }
}
