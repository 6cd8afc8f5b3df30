// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Routing of fingerprint snapshots to the local store or, over ssh, to the
//! store on the configured remote host.
//!
//! Remote submission pipes the JSON interchange document into
//! `lfst import --stdin` on the remote side and treats its exit code as the
//! acknowledgement. Diffing needs both snapshots in one store, so it is only
//! available locally.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lfst_checksum::{ChecksumExport, FileChecksum};
use lfst_config::LfstConfig;
use lfst_local_db::{ChecksumStore, Database, DbError, RunStore};
use tracing::{debug, info};

use crate::command::{run, CommandSpec, Outcome};
use crate::error::{Error, Result};
use crate::git::record_operation;

pub const IMPORTED_RUN_NOTE: &str = "Created by remote checksum import";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Local,
    Remote { host: String },
}

impl Destination {
    /// Pick where snapshots go. An explicit `--local` wins over an explicit
    /// `--remote HOST`, which wins over auto-detection from the config.
    pub fn decide(
        force_local: bool,
        force_remote: Option<&str>,
        config: &LfstConfig,
        hostname: &str,
    ) -> Self {
        let destination = if force_local {
            Destination::Local
        } else if let Some(host) = force_remote.filter(|h| !h.is_empty()) {
            Destination::Remote {
                host: host.to_string(),
            }
        } else if config.is_remote_host(hostname) {
            Destination::Remote {
                host: config.remote_host.clone(),
            }
        } else {
            Destination::Local
        };
        info!(
            %destination,
            force_local,
            force_remote = ?force_remote,
            hostname,
            "Resolved checksum destination"
        );
        destination
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Destination::Remote { .. })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Local => f.write_str("local"),
            Destination::Remote { host } => write!(f, "remote ({})", host),
        }
    }
}

/// Name of this machine as reported by the OS.
pub fn current_hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::environment(format!("cannot read hostname: {}", e), "Set a hostname"))?;
    Ok(name.to_string_lossy().into_owned())
}

/// Destination for fingerprint snapshots.
#[async_trait]
pub trait ChecksumSink: Send + Sync {
    /// Persist one snapshot, returning the number of fingerprints stored.
    async fn submit(&self, run_id: i64, step: u32, checksums: &[FileChecksum]) -> Result<usize>;

    fn describe(&self) -> String;
}

/// Writes straight into an open store.
pub struct LocalSink {
    db: Arc<Database>,
}

impl LocalSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChecksumSink for LocalSink {
    async fn submit(&self, run_id: i64, step: u32, checksums: &[FileChecksum]) -> Result<usize> {
        let conn = self.db.lock()?;
        let stored = ChecksumStore::new(&conn).record(run_id, step, checksums, chrono::Utc::now())?;
        debug!(run_id, step, stored, "Stored checksums locally");
        Ok(stored)
    }

    fn describe(&self) -> String {
        match self.db.path() {
            Some(path) => format!("local database {}", path.display()),
            None => "in-memory database".to_string(),
        }
    }
}

/// Kind tag of the ssh submission in the `operations` table.
pub const SUBMIT_OPERATION: &str = "checksum-submit";

/// Ships snapshots to `lfst import` on another host over ssh.
pub struct RemoteSink {
    host: String,
    remote_db: Option<String>,
    program: String,
    options: Vec<String>,
    remote_command: Option<String>,
    timeout: Option<Duration>,
    operation_log: Option<Arc<Database>>,
}

impl RemoteSink {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            remote_db: None,
            program: "ssh".to_string(),
            options: vec!["-o".to_string(), "BatchMode=yes".to_string()],
            remote_command: None,
            timeout: None,
            operation_log: None,
        }
    }

    /// Record each submission as an operation of the run in `db`, the
    /// store the run itself lives in.
    pub fn with_operation_log(mut self, db: Arc<Database>) -> Self {
        self.operation_log = Some(db);
        self
    }

    /// Database path on the remote host; its own config decides otherwise.
    pub fn with_remote_db(mut self, path: impl Into<String>) -> Self {
        self.remote_db = Some(path.into());
        self
    }

    /// Replace the `ssh` binary and its leading options.
    pub fn with_transport(mut self, program: impl Into<String>, options: Vec<String>) -> Self {
        self.program = program.into();
        self.options = options;
        self
    }

    /// Replace the command run on the remote side.
    pub fn with_remote_command(mut self, command: impl Into<String>) -> Self {
        self.remote_command = Some(command.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn remote_command_line(&self) -> String {
        if let Some(command) = &self.remote_command {
            return command.clone();
        }
        let mut line = "lfst import --stdin --ensure-run".to_string();
        if let Some(db) = &self.remote_db {
            line.push_str(" --db ");
            line.push_str(&shell_quote(db));
        }
        line
    }
}

#[async_trait]
impl ChecksumSink for RemoteSink {
    async fn submit(&self, run_id: i64, step: u32, checksums: &[FileChecksum]) -> Result<usize> {
        let payload = ChecksumExport::new(run_id, step, checksums.to_vec()).to_json()?;
        let spec = CommandSpec::new(&self.program)
            .args(self.options.iter().cloned())
            .arg(&self.host)
            .arg(self.remote_command_line())
            .stdin(payload)
            .timeout(self.timeout);

        info!(host = %self.host, run_id, step, files = checksums.len(), "Sending checksums to remote store");
        let output = run(&spec).await;
        if let Some(db) = &self.operation_log {
            record_operation(db, run_id, step, SUBMIT_OPERATION, &output);
        }
        if let Some(reason) = output.failure_message() {
            return Err(Error::Dispatch {
                host: self.host.clone(),
                reason,
            });
        }
        Ok(checksums.len())
    }

    fn describe(&self) -> String {
        format!("remote database on {}", self.host)
    }
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Confirm `host` accepts a non-interactive ssh login.
pub async fn check_remote_host(host: &str) -> Result<()> {
    let spec = CommandSpec::new("ssh")
        .args(["-o", "BatchMode=yes", "-o", "ConnectTimeout=5", host, "true"])
        .timeout(Some(Duration::from_secs(15)));
    let output = run(&spec).await;
    match output.outcome {
        Outcome::Success => Ok(()),
        _ => Err(Error::environment(
            format!(
                "cannot reach {} over ssh ({})",
                host,
                output.failure_message().unwrap_or_default()
            ),
            format!("Check that {} is reachable and key-based ssh login works", host),
        )),
    }
}

/// Store an interchange document; the receiving end of [`RemoteSink`].
///
/// With `ensure_run`, a placeholder run is created when the id is unknown
/// to this store. Snapshots are never merged into a run this store executed
/// itself, nor into a step that already has rows.
pub fn import_export(db: &Database, export: &ChecksumExport, ensure_run: bool) -> Result<usize> {
    let (run_id, step) = (export.run_id, export.step_number);
    let conn = db.lock()?;
    let runs = RunStore::new(&conn);
    if ensure_run {
        match runs.get(run_id)? {
            Some(run) if !run.is_imported_placeholder() => {
                return Err(Error::ImportConflict {
                    run_id,
                    step,
                    reason: format!(
                        "run {} on this store is a {} run of scenario {}, not an import",
                        run_id, run.status, run.scenario_id
                    ),
                });
            }
            Some(_) => {}
            None => {
                if runs.ensure_placeholder(run_id, IMPORTED_RUN_NOTE)? {
                    info!(run_id, "Created placeholder run for imported checksums");
                }
            }
        }
    } else {
        runs.require(run_id)?;
    }

    let stored = match ChecksumStore::new(&conn).record(
        run_id,
        step,
        &export.checksums,
        export.computed_at,
    ) {
        Err(DbError::SnapshotExists { .. }) => {
            return Err(Error::ImportConflict {
                run_id,
                step,
                reason: "the step already has checksums".to_string(),
            });
        }
        other => other?,
    };
    info!(run_id, step, stored, "Imported checksums");
    Ok(stored)
}
