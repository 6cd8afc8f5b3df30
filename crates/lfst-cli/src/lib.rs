// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Command-line surface of the LFS server evaluation tools.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use lfst_config::{LfstConfig, DATABASE_ENV};
use lfst_local_db::Database;
use lfst_logging::CliLoggingArgs;
use tracing::debug;

pub use clap::Parser;

pub mod checksum;
pub mod config_commands;
pub mod import;
pub mod query;
pub mod run_commands;
pub mod scenario_commands;

#[derive(clap::Parser)]
#[command(
    name = "lfst",
    about = "Git LFS server evaluation tool",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file (default: $LFS_TEST_CONFIG or <config dir>/lfs-test/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,
    /// SQLite database, overriding the config file and $LFS_TEST_DB
    #[arg(long, global = true)]
    pub db: Option<String>,
    #[command(flatten)]
    pub logging: CliLoggingArgs,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run, cancel and inspect evaluation scenarios
    Scenario {
        #[command(subcommand)]
        subcommand: scenario_commands::ScenarioCommands,
    },
    /// Fingerprint a directory and store or compare the result
    Checksum(checksum::ChecksumArgs),
    /// Store a checksum snapshot produced on another machine
    Import(import::ImportArgs),
    /// Inspect recorded test runs
    Run {
        #[command(subcommand)]
        subcommand: run_commands::RunCommands,
    },
    /// Run raw SQL against the database
    Query(query::QueryArgs),
    /// Show or initialize the configuration file
    Config {
        #[command(subcommand)]
        subcommand: config_commands::ConfigCommands,
    },
}

/// Global options every subcommand resolves its settings from.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<String>,
    pub db: Option<String>,
}

impl GlobalOptions {
    pub fn config_file(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(lfst_config::expand_path(path)),
            None => lfst_config::config_path().context("Failed to locate config file"),
        }
    }

    /// File, then environment, then `--db`.
    pub fn load_config(&self) -> Result<LfstConfig> {
        let path = self.config_file()?;
        let mut config = LfstConfig::resolve(Some(&path), |key| std::env::var(key).ok())
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        if let Some(db) = self.db.as_deref().filter(|d| !d.is_empty()) {
            debug!(db, "Database overridden on the command line");
            config.database = db.to_string();
        }
        Ok(config)
    }
}

/// Open the store named by `config`, creating its directory first.
pub fn open_database(config: &LfstConfig) -> Result<Arc<Database>> {
    let path = config
        .validate_database()
        .with_context(|| format!("Database unavailable (set --db or {})", DATABASE_ENV))?;
    let db = Database::open(&path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(db))
}

/// Print remediation advice attached to a core error, if any.
pub fn remediation_hint(err: &anyhow::Error) -> Option<String> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<lfst_core::Error>())
        .and_then(lfst_core::Error::remediation)
}
