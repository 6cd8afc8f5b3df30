// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // CLI commands intentionally print to stdout/stderr

//! Recorded run inspection
use anyhow::Result;
use clap::Subcommand;
use lfst_checksum::format_size;
use lfst_local_db::{
    ChecksumStore, OperationStore, RepositorySizeStore, RunStatus, RunStore, TestRunRecord,
};
use serde_json::json;

use crate::{open_database, GlobalOptions};

#[derive(Subcommand)]
pub enum RunCommands {
    /// List test runs, newest first
    List {
        /// Only runs with this status (running, completed, failed, cancelled)
        #[arg(long)]
        status: Option<RunStatus>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show a run with its operations, snapshots and repository sizes
    Show {
        /// Run id
        id: i64,
        #[arg(long)]
        json: bool,
    },
}

impl RunCommands {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        let config = global.load_config()?;
        let db = open_database(&config)?;
        let conn = db.lock()?;

        match self {
            RunCommands::List { status, json } => {
                let runs = RunStore::new(&conn).list(status)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&runs)?);
                } else if runs.is_empty() {
                    println!("No test runs recorded");
                } else {
                    println!(
                        "{:>5}  {:>8}  {:<16} {:<6} {:<10} {:<25} NOTES",
                        "ID", "SCENARIO", "SERVER", "PROTO", "STATUS", "STARTED"
                    );
                    for run in &runs {
                        print_run_row(run);
                    }
                }
            }
            RunCommands::Show { id, json } => {
                let run = RunStore::new(&conn).require(id)?;
                let operations = OperationStore::new(&conn).list(id, None)?;
                let steps = ChecksumStore::new(&conn).steps(id)?;
                let sizes = RepositorySizeStore::new(&conn).list(id)?;

                if json {
                    let document = json!({
                        "run": run,
                        "operations": operations,
                        "checksum_steps": steps,
                        "repository_sizes": sizes,
                    });
                    println!("{}", serde_json::to_string_pretty(&document)?);
                    return Ok(());
                }

                println!("Run {}", run.id);
                println!("  scenario:  {}", run.scenario_id);
                println!("  server:    {} ({} / {})", run.server_type, run.protocol, run.git_server);
                println!("  status:    {}", run.status);
                println!("  started:   {}", run.started_at);
                if let Some(completed) = &run.completed_at {
                    println!("  completed: {}", completed);
                }
                if let Some(dir) = &run.work_dir {
                    println!("  work dir:  {}", dir);
                }
                if !run.notes.is_empty() {
                    println!("  notes:     {}", run.notes);
                }

                println!();
                println!("Operations ({}):", operations.len());
                for op in &operations {
                    let error = op.error.as_deref().map(|e| format!("  {}", e)).unwrap_or_default();
                    println!(
                        "  step {}  {:<16} {:>8} ms  {}{}",
                        op.step_number,
                        op.operation,
                        op.duration_ms,
                        op.status.as_str(),
                        error
                    );
                }

                println!();
                println!("Checksum snapshots ({}):", steps.len());
                for step in &steps {
                    println!(
                        "  step {}  {} files, {}",
                        step.step_number,
                        step.file_count,
                        format_size(step.total_bytes.max(0) as u64)
                    );
                }

                if !sizes.is_empty() {
                    println!();
                    println!("Repository sizes:");
                    for size in &sizes {
                        let files = size
                            .file_count
                            .map(|n| format!(", {} files", n))
                            .unwrap_or_default();
                        println!(
                            "  step {}  {:<26} {}{}",
                            size.step_number,
                            size.location,
                            format_size(size.size_bytes.max(0) as u64),
                            files
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

fn print_run_row(run: &TestRunRecord) {
    println!(
        "{:>5}  {:>8}  {:<16} {:<6} {:<10} {:<25} {}",
        run.id,
        run.scenario_id,
        run.server_type,
        run.protocol,
        run.status.as_str(),
        run.started_at,
        run.notes
    );
}
