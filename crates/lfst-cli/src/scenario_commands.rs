// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // CLI commands intentionally print to stdout/stderr

//! Scenario execution, cancellation and inspection commands
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use lfst_checksum::format_size;
use lfst_core::detail::RepositoryDetail;
use lfst_core::scenario::{catalog, find};
use lfst_core::{
    check_remote_host, current_hostname, inspect_run, lead_process_group, CancelOutcome,
    CancelTarget, Canceller, ChecksumSink, Destination, GitContext, LocalSink, RemoteSink,
    RunOptions, ScenarioRunner, SignalOutcome, StorageClass,
};
use tracing::{info, warn};

use crate::{open_database, GlobalOptions};

#[derive(Subcommand)]
pub enum ScenarioCommands {
    /// List the built-in scenarios
    List,
    /// Execute a scenario through all seven steps
    Run(ScenarioRunArgs),
    /// Cancel a running scenario
    Cancel {
        /// Run id, or `all` for every running run
        target: String,
    },
    /// Show the files and object storage of a run's repositories
    Detail {
        /// Run id
        run_id: i64,
        /// Working root used when the run has no recorded directory
        #[arg(long)]
        work_dir: Option<String>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct ScenarioRunArgs {
    /// Scenario id (see `lfst scenario list`)
    pub id: u32,

    /// Root for the run's working directories
    #[arg(long)]
    pub work_dir: Option<String>,

    /// Directory holding the v1/ and v2/ test files
    #[arg(long)]
    pub test_data: Option<String>,

    /// Store checksums in the local database
    #[arg(long, conflicts_with = "remote")]
    pub local: bool,

    /// Send checksums to the database on HOST over ssh
    #[arg(long, value_name = "HOST")]
    pub remote: Option<String>,

    /// Fail step 6 when the second client's commit cannot be pulled back
    #[arg(long)]
    pub strict_sync: bool,

    /// Recreate the scenario's GitHub repository if it already exists
    #[arg(long)]
    pub force: bool,

    /// Per-command timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl ScenarioCommands {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        match self {
            ScenarioCommands::List => {
                list_scenarios();
                Ok(())
            }
            ScenarioCommands::Run(args) => args.run(global).await,
            ScenarioCommands::Cancel { target } => cancel(&target, global).await,
            ScenarioCommands::Detail { run_id, work_dir } => {
                detail(run_id, work_dir, global).await
            }
        }
    }
}

fn list_scenarios() {
    println!("{:>3}  {:<32} {:<16} {:<6} {:<7} SERVER", "ID", "NAME", "TYPE", "PROTO", "GIT");
    for scenario in catalog() {
        println!(
            "{:>3}  {:<32} {:<16} {:<6} {:<7} {}",
            scenario.id,
            scenario.name,
            scenario.server_type,
            scenario.protocol.as_str(),
            scenario.git_server.as_str(),
            scenario.server_url.as_deref().unwrap_or("-"),
        );
    }
}

impl ScenarioRunArgs {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        let mut config = global.load_config()?;
        if let Some(dir) = self.work_dir {
            config.work_dir = Some(dir);
        }
        if let Some(data) = self.test_data {
            config.test_data = Some(data);
        }
        if self.strict_sync {
            config.strict_sync = true;
        }
        if let Some(secs) = self.timeout {
            config.command_timeout_secs = Some(secs);
        }

        let scenario = find(self.id)?;
        let mut options = RunOptions::from_config(&config)?;
        options.force = self.force;

        let hostname = current_hostname()?;
        let destination = Destination::decide(self.local, self.remote.as_deref(), &config, &hostname);

        let db = open_database(&config)?;
        let sink: Arc<dyn ChecksumSink> = match &destination {
            Destination::Local => Arc::new(LocalSink::new(db.clone())),
            Destination::Remote { host } => {
                check_remote_host(host).await?;
                Arc::new(
                    RemoteSink::new(host.clone())
                        .with_timeout(config.command_timeout())
                        .with_operation_log(db.clone()),
                )
            }
        };

        println!("Scenario {}: {}", scenario.id, scenario.name);
        println!("Checksums: {}", sink.describe());

        // `scenario cancel` signals the recorded pid's group
        if let Err(e) = lead_process_group() {
            warn!(error = %e, "Running without a dedicated process group");
        }
        let runner = ScenarioRunner::new(scenario, db, options).with_sink(sink);
        let run_id = runner.execute().await?;
        info!(run_id, "Scenario finished");
        println!("Run {} completed all 7 steps", run_id);
        Ok(())
    }
}

async fn cancel(target: &str, global: &GlobalOptions) -> Result<()> {
    let Some(target) = CancelTarget::parse(target) else {
        bail!("Invalid cancel target {:?}: expected a run id or 'all'", target);
    };
    let config = global.load_config()?;
    let db = open_database(&config)?;
    let outcomes = Canceller::new(db, config.cancel_grace()).cancel(target).await?;

    if outcomes.is_empty() {
        println!("No running test runs");
    }
    for outcome in &outcomes {
        match outcome {
            CancelOutcome::Cancelled { run_id, signal } => {
                let how = match signal {
                    SignalOutcome::NoProcess => "process already gone",
                    SignalOutcome::Terminated => "process terminated",
                    SignalOutcome::Killed => "process killed",
                    SignalOutcome::SkippedSelf => "process not signalled",
                };
                println!("Cancelled run {} ({})", run_id, how);
            }
            CancelOutcome::NotRunning { run_id, status } => {
                println!("Run {} is already {}, nothing to cancel", run_id, status);
            }
        }
    }
    Ok(())
}

async fn detail(run_id: i64, work_dir: Option<String>, global: &GlobalOptions) -> Result<()> {
    let mut config = global.load_config()?;
    if let Some(dir) = work_dir {
        config.work_dir = Some(dir);
    }
    let db = open_database(&config)?;
    let git = GitContext::detached(config.command_timeout());
    let detail = inspect_run(&db, run_id, &config.work_dir_path(), &git).await?;

    let run = &detail.run;
    println!(
        "Run {}: scenario {} ({} over {}), {}",
        run.id, run.scenario_id, run.server_type, run.protocol, run.status
    );
    for repository in &detail.repositories {
        print_repository(repository);
    }
    Ok(())
}

fn print_repository(repository: &RepositoryDetail) {
    println!();
    println!("{} ({})", repository.label, repository.path.display());
    let Some(files) = &repository.files else {
        println!("  not present");
        return;
    };
    for file in files {
        let pointer = match &file.pointer {
            Some(p) => format!("  pointer {} ({})", p.oid, format_size(p.size)),
            None => String::new(),
        };
        println!(
            "  {:<9} {:>10}  {}{}",
            file.storage.as_str(),
            format_size(file.size_bytes),
            file.path,
            pointer
        );
    }
    println!(
        "  {} files, {}: {} lfs, {} git, {} untracked, {} ignored",
        files.len(),
        format_size(repository.total_bytes()),
        repository.count(StorageClass::Lfs),
        repository.count(StorageClass::Git),
        repository.count(StorageClass::Untracked),
        repository.count(StorageClass::Ignored),
    );
    if let Some(storage) = &repository.storage {
        println!("  storage: {}", storage);
    }
}
