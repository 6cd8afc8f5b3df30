// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS test_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    scenario_id INTEGER NOT NULL,
    server_type TEXT NOT NULL,
    protocol TEXT NOT NULL,
    git_server TEXT NOT NULL,
    pid INTEGER DEFAULT 0,
    work_dir TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    notes TEXT
);

CREATE TABLE IF NOT EXISTS operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    step_number INTEGER NOT NULL,
    operation TEXT NOT NULL,
    started_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    file_count INTEGER,
    total_bytes INTEGER,
    status TEXT NOT NULL,
    error TEXT,
    FOREIGN KEY (run_id) REFERENCES test_runs(id)
);

CREATE TABLE IF NOT EXISTS checksums (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    step_number INTEGER NOT NULL,
    file_path TEXT NOT NULL,
    crc32 TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    FOREIGN KEY (run_id) REFERENCES test_runs(id)
);

CREATE TABLE IF NOT EXISTS repository_sizes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    step_number INTEGER NOT NULL,
    location TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    file_count INTEGER,
    measured_at TEXT NOT NULL,
    FOREIGN KEY (run_id) REFERENCES test_runs(id)
);

CREATE INDEX IF NOT EXISTS idx_operations_run ON operations(run_id, step_number);
CREATE INDEX IF NOT EXISTS idx_checksums_run ON checksums(run_id, step_number);
CREATE INDEX IF NOT EXISTS idx_repo_sizes_run ON repository_sizes(run_id);
CREATE INDEX IF NOT EXISTS idx_test_runs_scenario ON test_runs(scenario_id);
CREATE INDEX IF NOT EXISTS idx_test_runs_status ON test_runs(status);
"#;

/// Columns added to `test_runs` after the first schema shipped.
const ADDED_RUN_COLUMNS: &[(&str, &str)] = &[("pid", "INTEGER DEFAULT 0"), ("work_dir", "TEXT")];

pub(crate) fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    migrate_run_columns(conn)?;
    ensure_unique_checksums(conn)
}

fn migrate_run_columns(conn: &Connection) -> Result<()> {
    let existing: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(test_runs)")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        names.collect::<rusqlite::Result<_>>()?
    };

    for (column, decl) in ADDED_RUN_COLUMNS {
        if !existing.iter().any(|name| name == column) {
            info!(column, "Adding missing test_runs column");
            conn.execute_batch(&format!("ALTER TABLE test_runs ADD COLUMN {} {}", column, decl))?;
        }
    }
    Ok(())
}

/// One fingerprint per (run, step, path). Stores written before the index
/// existed may hold duplicates; those keep opening and are reported.
fn ensure_unique_checksums(conn: &Connection) -> Result<()> {
    let duplicates: i64 = conn.query_row(
        "SELECT COUNT(*) FROM (SELECT 1 FROM checksums \
         GROUP BY run_id, step_number, file_path HAVING COUNT(*) > 1)",
        [],
        |row| row.get(0),
    )?;
    if duplicates > 0 {
        warn!(
            duplicates,
            "Checksums table holds duplicate paths; not adding the uniqueness index"
        );
        return Ok(());
    }
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_checksums_unique \
         ON checksums(run_id, step_number, file_path)",
    )?;
    Ok(())
}
