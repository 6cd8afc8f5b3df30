// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // CLI commands intentionally print to stdout/stderr

//! Standalone directory fingerprinting
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use lfst_checksum::{compute_directory, format_size, ChecksumExport, FileChecksum};
use lfst_core::{current_hostname, import_export, ChecksumSink, Destination, RemoteSink};
use lfst_local_db::ChecksumStore;
use tracing::{info, warn};

use crate::{open_database, GlobalOptions};

#[derive(Args, Clone, Debug)]
pub struct ChecksumArgs {
    /// Directory to fingerprint
    #[arg(long)]
    pub dir: PathBuf,

    /// Run the snapshot belongs to
    #[arg(long, requires = "step")]
    pub run_id: Option<i64>,

    /// Step number of the snapshot
    #[arg(long, requires = "run_id")]
    pub step: Option<u32>,

    /// Compare against this earlier step of the same run
    #[arg(long, value_name = "STEP", requires = "step")]
    pub compare: Option<u32>,

    /// Print only, do not store
    #[arg(long)]
    pub skip_db: bool,

    /// Print the snapshot as interchange JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Store in the local database
    #[arg(long, conflicts_with = "remote")]
    pub local: bool,

    /// Store in the database on HOST over ssh
    #[arg(long, value_name = "HOST")]
    pub remote: Option<String>,
}

impl ChecksumArgs {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        if !self.dir.is_dir() {
            bail!("{} is not a directory", self.dir.display());
        }
        let dir = self.dir.clone();
        let checksums = tokio::task::spawn_blocking(move || compute_directory(&dir))
            .await?
            .with_context(|| format!("Failed to fingerprint {}", self.dir.display()))?;
        info!(dir = %self.dir.display(), files = checksums.len(), "Computed checksums");

        if self.json {
            let export = ChecksumExport::new(
                self.run_id.unwrap_or_default(),
                self.step.unwrap_or_default(),
                checksums.clone(),
            );
            println!("{}", export.to_json()?);
        } else {
            print_table(&checksums);
        }

        if self.skip_db {
            return Ok(());
        }
        let (Some(run_id), Some(step)) = (self.run_id, self.step) else {
            bail!("--run-id and --step are required to store checksums (or pass --skip-db)");
        };

        let config = global.load_config()?;
        let hostname = current_hostname()?;
        let destination = Destination::decide(self.local, self.remote.as_deref(), &config, &hostname);

        match &destination {
            Destination::Local => {
                let db = open_database(&config)?;
                let export = ChecksumExport::new(run_id, step, checksums);
                let stored = import_export(&db, &export, false)?;
                eprintln!("Stored {} checksums for run {} step {}", stored, run_id, step);

                if let Some(earlier) = self.compare {
                    let conn = db.lock()?;
                    let differences = ChecksumStore::new(&conn).diff(run_id, earlier, step)?;
                    if !differences.is_empty() {
                        for difference in &differences {
                            println!("{}", difference);
                        }
                        return Err(lfst_core::Error::SnapshotMismatch {
                            from: earlier,
                            to: step,
                            differences,
                        }
                        .into());
                    }
                    println!("Step {} matches step {}", step, earlier);
                }
            }
            Destination::Remote { host } => {
                let sink = RemoteSink::new(host.clone()).with_timeout(config.command_timeout());
                let sink: Arc<dyn ChecksumSink> = Arc::new(sink);
                let stored = sink.submit(run_id, step, &checksums).await?;
                eprintln!("Sent {} checksums to {}", stored, sink.describe());
                if self.compare.is_some() {
                    warn!(host = %host, "Comparison skipped for remote storage");
                    eprintln!(
                        "Comparison needs both snapshots in one database; run it on {} instead",
                        host
                    );
                }
            }
        }
        Ok(())
    }
}

fn print_table(checksums: &[FileChecksum]) {
    let mut total = 0u64;
    for checksum in checksums {
        total += checksum.size_bytes;
        println!(
            "{}  {:>10}  {}",
            checksum.crc32_hex(),
            format_size(checksum.size_bytes),
            checksum.path
        );
    }
    println!("{} files, {}", checksums.len(), format_size(total));
}
