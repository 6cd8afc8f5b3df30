// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SQLite persistence for evaluation runs.
//!
//! Several `lfst` processes (the scenario runner on a client machine, an
//! `lfst import` spawned over SSH, an operator running `lfst scenario
//! cancel`) may open the same database file at once. The connection is
//! therefore opened in WAL mode with a busy timeout, and run status changes
//! are guarded in SQL rather than in memory.

pub mod database;
pub mod error;
pub mod models;
mod schema;

pub use database::{Database, QueryResult, BUSY_TIMEOUT};
pub use error::{DbError, Result};
pub use models::{
    ChecksumStore, NewTestRun, OperationRecord, OperationStatus, OperationStore,
    RepositorySizeRecord, RepositorySizeStore, RunStatus, RunStore, StepSummary, TestRunRecord,
    IMPORTED_SERVER_TYPE,
};

/// Current time in the format every table stores timestamps in.
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
