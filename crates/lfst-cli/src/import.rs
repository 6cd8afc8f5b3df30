// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // CLI commands intentionally print to stdout/stderr

//! Receiving end of remote checksum dispatch
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use lfst_checksum::ChecksumExport;
use lfst_core::import_export;
use tokio::io::AsyncReadExt;

use crate::{open_database, GlobalOptions};

#[derive(Args, Clone, Debug)]
pub struct ImportArgs {
    /// Interchange JSON file
    #[arg(conflicts_with = "stdin")]
    pub file: Option<PathBuf>,

    /// Read the interchange JSON from standard input
    #[arg(long)]
    pub stdin: bool,

    /// Create a placeholder run when the run id is unknown here. Runs this
    /// store executed itself never receive imported snapshots.
    #[arg(long)]
    pub ensure_run: bool,
}

impl ImportArgs {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        let data = match (&self.file, self.stdin) {
            (Some(path), _) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?,
            (None, true) => {
                let mut data = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut data)
                    .await
                    .context("Failed to read standard input")?;
                data
            }
            (None, false) => bail!("Pass a FILE or --stdin"),
        };

        let export = ChecksumExport::from_json(&data).context("Invalid checksum document")?;
        let config = global.load_config()?;
        let db = open_database(&config)?;
        let stored = import_export(&db, &export, self.ensure_run)?;
        println!(
            "Imported {} checksums for run {} step {}",
            stored, export.run_id, export.step_number
        );
        Ok(())
    }
}
