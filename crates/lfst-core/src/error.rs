// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::time::Duration;

use lfst_checksum::Difference;
use thiserror::Error;

use crate::verify::IntegrityError;

/// Broad class of a failure, used to pick user-facing remediation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing tool, unreachable host, unwritable store
    Environment,
    /// An external command ran and failed, or could not be started
    Execution,
    /// Content or storage layout is not what the workflow committed
    Integrity,
    /// The run was cancelled from another process
    Cancelled,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{what}. {remediation}")]
    Environment { what: String, remediation: String },

    #[error("failed to start {program}: {message}")]
    Spawn {
        program: String,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("{command} failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(
        "checksum mismatch: {} differences between step {from} and step {to}: {}",
        .differences.len(),
        summarize(.differences)
    )]
    SnapshotMismatch {
        from: u32,
        to: u32,
        differences: Vec<Difference>,
    },

    #[error("no synchronization transport for {0}")]
    SyncUnavailable(String),

    #[error("run {run_id} failed at step {phase}: {source}")]
    PhaseFailed {
        run_id: i64,
        phase: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("run {run_id} was cancelled")]
    Cancelled { run_id: i64 },

    #[error("remote dispatch to {host} failed: {reason}")]
    Dispatch { host: String, reason: String },

    #[error("cannot import checksums for run {run_id} step {step}: {reason}")]
    ImportConflict {
        run_id: i64,
        step: u32,
        reason: String,
    },

    #[error("unknown scenario {0}")]
    UnknownScenario(u32),

    #[error(transparent)]
    Database(#[from] lfst_local_db::DbError),

    #[error(transparent)]
    Checksum(#[from] lfst_checksum::ChecksumError),

    #[error(transparent)]
    Config(#[from] lfst_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn environment(what: impl Into<String>, remediation: impl Into<String>) -> Self {
        Error::Environment {
            what: what.into(),
            remediation: remediation.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Environment { .. } | Error::Config(_) | Error::SyncUnavailable(_) => {
                ErrorKind::Environment
            }
            Error::Spawn { kind, .. } if *kind == std::io::ErrorKind::NotFound => {
                ErrorKind::Environment
            }
            Error::Spawn { .. }
            | Error::CommandFailed { .. }
            | Error::Timeout { .. }
            | Error::Dispatch { .. } => ErrorKind::Execution,
            Error::Integrity(_) | Error::SnapshotMismatch { .. } | Error::ImportConflict { .. } => {
                ErrorKind::Integrity
            }
            Error::PhaseFailed { source, .. } => source.kind(),
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::UnknownScenario(_)
            | Error::Database(_)
            | Error::Checksum(_)
            | Error::Io(_)
            | Error::Join(_) => ErrorKind::Internal,
        }
    }

    /// Operator hint for failures that have an obvious fix.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::Environment { remediation, .. } => Some(remediation.clone()),
            Error::Spawn { program, kind, .. } if *kind == std::io::ErrorKind::NotFound => {
                Some(format!("Install {} and make sure it is on PATH", program))
            }
            Error::Spawn { program, kind, .. }
                if *kind == std::io::ErrorKind::PermissionDenied =>
            {
                Some(format!("Check execute permissions on {}", program))
            }
            Error::PhaseFailed { source, .. } => source.remediation(),
            Error::ImportConflict { .. } => Some(
                "Import into a store reserved for shipped snapshots (lfst import --db PATH)".to_string(),
            ),
            _ => None,
        }
    }
}

fn summarize(differences: &[Difference]) -> String {
    const SHOWN: usize = 5;
    let mut parts: Vec<String> = differences
        .iter()
        .take(SHOWN)
        .map(|d| format!("{} {}", d.kind, d.path))
        .collect();
    if differences.len() > SHOWN {
        parts.push(format!("and {} more", differences.len() - SHOWN));
    }
    parts.join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
