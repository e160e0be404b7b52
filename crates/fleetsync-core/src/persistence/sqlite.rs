//! SQLite blob store
//!
//! Schema:
//! - snapshot table: a single row (id = 1) holding the serialized cache and
//!   the instant it was written
//!
//! Uses WAL mode; the WAL is checkpointed when the store is dropped.

use super::BlobStore;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Database file name used inside a state directory
pub const DATABASE_FILE: &str = "cache-snapshot.db";

/// SQLite-backed blob store (thread-safe)
pub struct SqliteBlobStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteBlobStore {
    /// Create or open the database inside `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let db_path = dir.join(DATABASE_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open snapshot database: {}", db_path.display()))?;

        let store = Self::init(conn, Some(db_path))?;
        debug!(path = %store.describe(), "Snapshot database opened");
        Ok(store)
    }

    /// Database that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                saved_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Snapshot database lock poisoned: {}", e))
    }
}

impl BlobStore for SqliteBlobStore {
    fn load_blob(&self) -> Result<Option<String>> {
        let conn = self.lock()?;
        let blob: Option<String> = conn
            .query_row("SELECT data FROM snapshot WHERE id = 1", [], |row| row.get(0))
            .optional()
            .context("Failed to query snapshot")?;
        Ok(blob)
    }

    fn save_blob(&self, blob: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO snapshot (id, saved_at, data) VALUES (1, ?, ?)",
            params![Utc::now().to_rfc3339(), blob],
        )
        .context("Failed to store snapshot")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM snapshot", [])
            .context("Failed to clear snapshot")?;
        debug!("Snapshot table cleared");
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.db_path {
            Some(path) => format!("sqlite:{}", path.display()),
            None => "sqlite::memory:".to_string(),
        }
    }
}

impl Drop for SqliteBlobStore {
    fn drop(&mut self) {
        if self.db_path.is_none() {
            return;
        }
        // Flush the WAL into the main file so it does not grow across restarts
        if let Ok(conn) = self.conn.lock() {
            if let Err(e) = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE") {
                warn!("Failed to checkpoint WAL on SqliteBlobStore drop: {}", e);
            }
        }
    }
}
