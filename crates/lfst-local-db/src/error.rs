// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to acquire database lock: {0}")]
    Lock(String),

    #[error("Run {0} not found")]
    RunNotFound(i64),

    #[error("Run {run_id} already has checksums for step {step}")]
    SnapshotExists { run_id: i64, step: u32 },

    #[error("Invalid stored value: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Checksum(#[from] lfst_checksum::ChecksumError),
}

pub type Result<T> = std::result::Result<T, DbError>;
