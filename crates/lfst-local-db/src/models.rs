// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Records and stores for each table.
//!
//! Stores borrow a connection obtained from [`crate::Database::lock`] and are
//! cheap to construct per call.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lfst_checksum::{crc32_from_hex, diff, Difference, FileChecksum};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::{format_timestamp, now_timestamp};

const NOTE_SEPARATOR: &str = " | ";

/// `server_type` of runs created to hold snapshots shipped from another host.
pub const IMPORTED_SERVER_TYPE: &str = "imported";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(DbError::InvalidData(format!("unknown run status {:?}", other))),
        }
    }
}

/// A row of `test_runs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunRecord {
    pub id: i64,
    pub scenario_id: i64,
    pub server_type: String,
    pub protocol: String,
    pub git_server: String,
    /// Process id of the runner; 0 once the run is finished.
    pub pid: i64,
    pub work_dir: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: RunStatus,
    pub notes: String,
}

impl TestRunRecord {
    /// Whether this row was created by [`RunStore::ensure_placeholder`]
    /// rather than by a run executing against this store.
    pub fn is_imported_placeholder(&self) -> bool {
        self.server_type == IMPORTED_SERVER_TYPE
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<(Self, String)> {
        let status: String = row.get("status")?;
        Ok((
            Self {
                id: row.get("id")?,
                scenario_id: row.get("scenario_id")?,
                server_type: row.get("server_type")?,
                protocol: row.get("protocol")?,
                git_server: row.get("git_server")?,
                pid: row.get::<_, Option<i64>>("pid")?.unwrap_or(0),
                work_dir: row.get("work_dir")?,
                started_at: row.get("started_at")?,
                completed_at: row.get("completed_at")?,
                status: RunStatus::Running,
                notes: row.get::<_, Option<String>>("notes")?.unwrap_or_default(),
            },
            status,
        ))
    }
}

/// Fields supplied when a run is created; the store assigns the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTestRun {
    pub scenario_id: i64,
    pub server_type: String,
    pub protocol: String,
    pub git_server: String,
    pub pid: i64,
    pub work_dir: Option<String>,
    pub notes: String,
}

const RUN_COLUMNS: &str = "id, scenario_id, server_type, protocol, git_server, pid, work_dir, \
                           started_at, completed_at, status, notes";

pub struct RunStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> RunStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Insert a new run in the `running` state and return its id.
    pub fn insert(&self, run: &NewTestRun) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO test_runs (scenario_id, server_type, protocol, git_server, pid, work_dir, \
             started_at, status, notes) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.scenario_id,
                run.server_type,
                run.protocol,
                run.git_server,
                run.pid,
                run.work_dir,
                now_timestamp(),
                RunStatus::Running.as_str(),
                run.notes,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<TestRunRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM test_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                TestRunRecord::from_row,
            )
            .optional()?;
        row.map(with_status).transpose()
    }

    /// Like [`RunStore::get`] but a missing run is an error.
    pub fn require(&self, id: i64) -> Result<TestRunRecord> {
        self.get(id)?.ok_or(DbError::RunNotFound(id))
    }

    /// Runs, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<RunStatus>) -> Result<Vec<TestRunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM test_runs WHERE (?1 IS NULL OR status = ?1) ORDER BY id DESC",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], TestRunRecord::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(with_status(row?)?);
        }
        Ok(runs)
    }

    /// Make sure run `id` exists so snapshots shipped from another machine
    /// have a parent row. Creates a finished placeholder when missing and
    /// returns whether one was created.
    pub fn ensure_placeholder(&self, id: i64, note: &str) -> Result<bool> {
        let now = now_timestamp();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO test_runs (id, scenario_id, server_type, protocol, git_server, \
             pid, started_at, completed_at, status, notes) \
             VALUES (?1, 0, ?2, 'ssh', 'unknown', 0, ?3, ?3, ?4, ?5)",
            params![id, IMPORTED_SERVER_TYPE, now, RunStatus::Completed.as_str(), note],
        )?;
        Ok(inserted == 1)
    }

    pub fn set_work_dir(&self, id: i64, work_dir: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE test_runs SET work_dir = ?1 WHERE id = ?2",
            params![work_dir, id],
        )?;
        Ok(())
    }

    pub fn set_pid(&self, id: i64, pid: i64) -> Result<()> {
        self.conn
            .execute("UPDATE test_runs SET pid = ?1 WHERE id = ?2", params![pid, id])?;
        Ok(())
    }

    /// Append a milestone to the run's notes.
    pub fn append_note(&self, id: i64, note: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE test_runs SET notes = CASE \
                 WHEN notes IS NULL OR notes = '' THEN ?1 \
                 ELSE notes || ?2 || ?1 END \
             WHERE id = ?3",
            params![note, NOTE_SEPARATOR, id],
        )?;
        if changed == 0 {
            return Err(DbError::RunNotFound(id));
        }
        Ok(())
    }

    /// Move a running run to a terminal `status`, stamping completion time
    /// and appending `note` if given.
    ///
    /// Returns `false` without touching the row when the run is not
    /// `running` any more, so terminal states are never overwritten.
    pub fn finish(&self, id: i64, status: RunStatus, note: Option<&str>) -> Result<bool> {
        if !status.is_terminal() {
            return Err(DbError::InvalidData(format!(
                "cannot finish run {} with non-terminal status {}",
                id, status
            )));
        }

        let changed = self.conn.execute(
            "UPDATE test_runs SET status = ?1, completed_at = ?2, pid = 0, notes = CASE \
                 WHEN ?3 IS NULL THEN notes \
                 WHEN notes IS NULL OR notes = '' THEN ?3 \
                 ELSE notes || ?4 || ?3 END \
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                now_timestamp(),
                note,
                NOTE_SEPARATOR,
                id,
                RunStatus::Running.as_str()
            ],
        )?;
        Ok(changed == 1)
    }
}

fn with_status((mut record, status): (TestRunRecord, String)) -> Result<TestRunRecord> {
    record.status = status.parse()?;
    Ok(record)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
        }
    }
}

/// One timed external command within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: i64,
    pub run_id: i64,
    pub step_number: u32,
    /// Kind tag, e.g. `clone` or `commit`
    pub operation: String,
    pub started_at: String,
    pub duration_ms: i64,
    pub file_count: Option<i64>,
    pub total_bytes: Option<i64>,
    pub status: OperationStatus,
    pub error: Option<String>,
}

pub struct OperationStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> OperationStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, op: &OperationRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO operations (run_id, step_number, operation, started_at, duration_ms, \
             file_count, total_bytes, status, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                op.run_id,
                op.step_number,
                op.operation,
                op.started_at,
                op.duration_ms,
                op.file_count,
                op.total_bytes,
                op.status.as_str(),
                op.error,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Operations of a run in insertion order, optionally for one step.
    pub fn list(&self, run_id: i64, step: Option<u32>) -> Result<Vec<OperationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, step_number, operation, started_at, duration_ms, file_count, \
             total_bytes, status, error FROM operations \
             WHERE run_id = ?1 AND (?2 IS NULL OR step_number = ?2) ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id, step], |row| {
            let status: String = row.get(8)?;
            Ok((
                OperationRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    step_number: row.get(2)?,
                    operation: row.get(3)?,
                    started_at: row.get(4)?,
                    duration_ms: row.get(5)?,
                    file_count: row.get(6)?,
                    total_bytes: row.get(7)?,
                    status: OperationStatus::Success,
                    error: row.get(9)?,
                },
                status,
            ))
        })?;

        let mut ops = Vec::new();
        for row in rows {
            let (mut op, status) = row?;
            op.status = match status.as_str() {
                "success" => OperationStatus::Success,
                "failed" => OperationStatus::Failed,
                other => {
                    return Err(DbError::InvalidData(format!(
                        "unknown operation status {:?}",
                        other
                    )))
                }
            };
            ops.push(op);
        }
        Ok(ops)
    }
}

/// Number of fingerprints and bytes recorded for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_number: u32,
    pub file_count: i64,
    pub total_bytes: i64,
}

/// Fingerprint snapshots keyed by (run, step, path).
pub struct ChecksumStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> ChecksumStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Persist a snapshot in one transaction.
    ///
    /// A step is written once; recording a step that already has rows fails
    /// with [`DbError::SnapshotExists`] and leaves the store unchanged.
    pub fn record(
        &self,
        run_id: i64,
        step_number: u32,
        checksums: &[FileChecksum],
        computed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let computed_at = format_timestamp(computed_at);
        let exists = || DbError::SnapshotExists {
            run_id,
            step: step_number,
        };
        if self.has_step(run_id, step_number)? {
            return Err(exists());
        }
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO checksums (run_id, step_number, file_path, crc32, size_bytes, computed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for cs in checksums {
                let inserted = stmt.execute(params![
                    run_id,
                    step_number,
                    cs.path,
                    cs.crc32_hex(),
                    size_to_sql(cs.size_bytes)?,
                    computed_at,
                ]);
                match inserted {
                    Ok(_) => {}
                    // A concurrent writer got to the same step first
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                    {
                        return Err(exists());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tx.commit()?;
        Ok(checksums.len())
    }

    pub fn has_step(&self, run_id: i64, step_number: u32) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM checksums WHERE run_id = ?1 AND step_number = ?2 LIMIT 1",
                params![run_id, step_number],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The snapshot for one step, sorted by path.
    pub fn list(&self, run_id: i64, step_number: u32) -> Result<Vec<FileChecksum>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_path, crc32, size_bytes FROM checksums \
             WHERE run_id = ?1 AND step_number = ?2 ORDER BY file_path, id",
        )?;
        let rows = stmt.query_map(params![run_id, step_number], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut checksums = Vec::new();
        for row in rows {
            let (path, hex, size) = row?;
            let size_bytes = u64::try_from(size)
                .map_err(|_| DbError::InvalidData(format!("negative size for {}", path)))?;
            checksums.push(FileChecksum {
                crc32: crc32_from_hex(&hex)?,
                path,
                size_bytes,
            });
        }
        Ok(checksums)
    }

    /// Differences going from `old_step` to `new_step`, sorted by path.
    pub fn diff(&self, run_id: i64, old_step: u32, new_step: u32) -> Result<Vec<Difference>> {
        let old = self.list(run_id, old_step)?;
        let new = self.list(run_id, new_step)?;
        Ok(diff(&old, &new))
    }

    pub fn steps(&self, run_id: i64) -> Result<Vec<StepSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT step_number, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM checksums \
             WHERE run_id = ?1 GROUP BY step_number ORDER BY step_number",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(StepSummary {
                step_number: row.get(0)?,
                file_count: row.get(1)?,
                total_bytes: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

fn size_to_sql(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| DbError::InvalidData(format!("size {} exceeds i64", size)))
}

/// Measured on-disk size of part of a repository, e.g. `repo1/.git/lfs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySizeRecord {
    pub run_id: i64,
    pub step_number: u32,
    pub location: String,
    pub size_bytes: i64,
    pub file_count: Option<i64>,
    pub measured_at: String,
}

pub struct RepositorySizeStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> RepositorySizeStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn insert(&self, record: &RepositorySizeRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO repository_sizes (run_id, step_number, location, size_bytes, file_count, measured_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.run_id,
                record.step_number,
                record.location,
                record.size_bytes,
                record.file_count,
                record.measured_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list(&self, run_id: i64) -> Result<Vec<RepositorySizeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, step_number, location, size_bytes, file_count, measured_at \
             FROM repository_sizes WHERE run_id = ?1 ORDER BY step_number, id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(RepositorySizeRecord {
                run_id: row.get(0)?,
                step_number: row.get(1)?,
                location: row.get(2)?,
                size_bytes: row.get(3)?,
                file_count: row.get(4)?,
                measured_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
