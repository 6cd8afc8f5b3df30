// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::schema;

/// How long a writer waits on another process's lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Handle to the evaluation database.
///
/// The mutex only serializes use of the connection inside this process;
/// cross-process coordination is left to SQLite's WAL and busy timeout.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (and create if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode = configure(&conn)?;
        schema::apply(&conn)?;
        debug!(path = %path.display(), journal_mode = %journal_mode, "Opened database");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        schema::apply(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Mutex<Connection> {
        &self.conn
    }

    /// Lock the connection, mapping a poisoned mutex to [`DbError::Lock`].
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| DbError::Lock(e.to_string()))
    }

    /// Run an arbitrary read query and stringify every cell.
    ///
    /// This exists for ad hoc reporting; nothing in the runner depends on it.
    pub fn query_raw(&self, sql: &str) -> Result<QueryResult> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(render_cell(row.get_ref(idx)?));
            }
            rows.push(cells);
        }

        Ok(QueryResult { columns, rows })
    }
}

/// Result of [`Database::query_raw`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn configure(conn: &Connection) -> Result<String> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(journal_mode)
}

fn render_cell(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("nested").join("lfs-test.db")).unwrap();

        let conn = db.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_query_raw() {
        let db = Database::open_in_memory().unwrap();
        let result = db
            .query_raw("SELECT 1 AS one, 'two' AS two, NULL AS three, 2.5 AS four")
            .unwrap();
        assert_eq!(result.columns, vec!["one", "two", "three", "four"]);
        assert_eq!(result.rows, vec![vec!["1", "two", "NULL", "2.5"]]);
    }

    #[test]
    fn test_query_raw_rejects_bad_sql() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.query_raw("SELECT FROM nowhere"),
            Err(DbError::Sqlite(_))
        ));
    }
}
