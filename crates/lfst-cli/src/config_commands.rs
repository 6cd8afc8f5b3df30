// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // CLI commands intentionally print to stdout/stderr

//! Configuration management commands
use anyhow::{Context, Result};
use clap::Subcommand;
use lfst_config::LfstConfig;

use crate::GlobalOptions;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the resolved configuration as TOML
    Show,
    /// Show the config file location
    Path,
    /// Write the default configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommands {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        match self {
            ConfigCommands::Show => {
                let config = global.load_config()?;
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
            ConfigCommands::Path => {
                println!("{}", global.config_file()?.display());
                Ok(())
            }
            ConfigCommands::Init { force } => {
                let path = global.config_file()?;
                if path.exists() && !force {
                    println!("{} already exists (use --force to overwrite)", path.display());
                    return Ok(());
                }
                LfstConfig::default()
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote default configuration to {}", path.display());
                Ok(())
            }
        }
    }
}
