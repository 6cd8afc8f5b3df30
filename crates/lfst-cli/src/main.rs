// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // Reports the final error on stderr

use lfst_cli::{remediation_hint, Cli, Commands, GlobalOptions, Parser};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.logging.init("lfst") {
        eprintln!("Warning: failed to initialize logging: {:#}", e);
    }

    let global = GlobalOptions {
        config: cli.config.clone(),
        db: cli.db.clone(),
    };
    let result = match cli.command {
        Commands::Scenario { subcommand } => subcommand.run(&global).await,
        Commands::Checksum(args) => args.run(&global).await,
        Commands::Import(args) => args.run(&global).await,
        Commands::Run { subcommand } => subcommand.run(&global).await,
        Commands::Query(args) => args.run(&global).await,
        Commands::Config { subcommand } => subcommand.run(&global).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        if let Some(hint) = remediation_hint(&e) {
            eprintln!("Hint: {}", hint);
        }
        std::process::exit(1);
    }
}
