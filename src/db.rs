//! SQLite storage for the library catalog, backup records and settings.
//!
//! The connection is wrapped in an explicit handle that callers pass around;
//! there is no process-wide database. Lock durations are short (single
//! statements or small transactions), so a std Mutex is fine here.

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS games (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    exe_path TEXT,
    save_path TEXT,
    release_year INTEGER,
    backup_count INTEGER NOT NULL DEFAULT 0,
    last_backup TEXT
);
CREATE TABLE IF NOT EXISTS backups (
    id TEXT PRIMARY KEY,
    game_id TEXT NOT NULL,
    backup_path TEXT NOT NULL,
    mode TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    is_auto INTEGER NOT NULL DEFAULT 0,
    notes TEXT
);
CREATE INDEX IF NOT EXISTS idx_backups_game ON backups (game_id, created_at);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and throwaway tooling.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection. Poisoned locks are unrecoverable
    /// here, so we propagate them as a database error rather than panic.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| crate::error::SqobaError::Other("database lock poisoned".into()))?;
        Ok(f(&guard)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_applies_on_open() {
        let db = Database::open_in_memory().expect("open");
        let count: i64 = db
            .with(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('games', 'backups', 'settings')",
                    [],
                    |row| row.get(0),
                )
            })
            .expect("query");
        assert_eq!(count, 3);
    }
}
