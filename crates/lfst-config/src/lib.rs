// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Resolved configuration for `lfst`.
//!
//! Precedence, highest first: command-line flags (applied by the caller),
//! environment variables, the TOML config file, built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "LFS_TEST_CONFIG";
pub const DATABASE_ENV: &str = "LFS_TEST_DB";
pub const REMOTE_HOST_ENV: &str = "LFS_REMOTE_HOST";
pub const AUTO_REMOTE_ENV: &str = "LFS_AUTO_REMOTE";
pub const TEST_DATA_ENV: &str = "LFS_TEST_DATA";
pub const WORK_DIR_ENV: &str = "LFS_TEST_WORK_DIR";

const DEFAULT_DATABASE: &str = "~/lfs_eval/lfs-test.db";
const DEFAULT_REMOTE_HOST: &str = "gojira";
const DEFAULT_CANCEL_GRACE_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Database location {path} is not writable: {source}. Check permissions or set LFS_TEST_DB")]
    DatabaseNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings shared by every `lfst` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LfstConfig {
    /// SQLite store; `~` is expanded
    pub database: String,
    /// Host that owns the store when dispatching remotely
    pub remote_host: String,
    /// Ship checksums to `remote_host` automatically when running elsewhere
    pub auto_remote: bool,
    /// Directory holding the `v1/` and `v2/` test file sets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_data: Option<String>,
    /// Root under which scenario working directories are created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Upper bound for a single git/LFS command; unset means no limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    pub cancel_grace_secs: u64,
    /// Fail step 6 instead of warning when no pull transport exists
    pub strict_sync: bool,
}

impl Default for LfstConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            remote_host: DEFAULT_REMOTE_HOST.to_string(),
            auto_remote: true,
            test_data: None,
            work_dir: None,
            command_timeout_secs: None,
            cancel_grace_secs: DEFAULT_CANCEL_GRACE_SECS,
            strict_sync: false,
        }
    }
}

impl LfstConfig {
    /// Load from the process environment and the default config path.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let path = config_path_with(&env)?;
        Self::resolve(Some(&path), env)
    }

    /// Resolve from an explicit file (missing is fine) and an environment
    /// lookup.
    pub fn resolve<F>(file: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?.unwrap_or_default(),
            None => Self::default(),
        };
        config.apply_env(env);
        Ok(config)
    }

    /// Parse `path`; `Ok(None)` when it does not exist.
    pub fn from_file(path: &Path) -> Result<Option<Self>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(None);
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        toml::from_str(&text).map(Some).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| env(key).filter(|v| !v.is_empty());

        if let Some(db) = non_empty(DATABASE_ENV) {
            self.database = db;
        }
        if let Some(host) = non_empty(REMOTE_HOST_ENV) {
            self.remote_host = host;
        }
        if let Some(auto) = non_empty(AUTO_REMOTE_ENV) {
            self.auto_remote = auto == "true" || auto == "1";
        }
        if let Some(data) = non_empty(TEST_DATA_ENV) {
            self.test_data = Some(data);
        }
        if let Some(dir) = non_empty(WORK_DIR_ENV) {
            self.work_dir = Some(dir);
        }
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database)
    }

    pub fn test_data_path(&self) -> Option<PathBuf> {
        self.test_data.as_deref().map(expand_path)
    }

    /// Scenario working root; defaults to `<tmp>/lfst`.
    pub fn work_dir_path(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) => expand_path(dir),
            None => std::env::temp_dir().join("lfst"),
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Whether `hostname` is a machine other than the store host while
    /// auto-detection is enabled. Only the first DNS label is compared.
    pub fn is_remote_host(&self, hostname: &str) -> bool {
        self.auto_remote && !self.remote_host.is_empty() && !same_host(hostname, &self.remote_host)
    }

    /// Create the database directory and confirm it accepts writes.
    pub fn validate_database(&self) -> Result<PathBuf> {
        let path = self.database_path();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let not_writable = |source| ConfigError::DatabaseNotWritable {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(not_writable)?;
        let marker = dir.join(".lfst-write-test");
        std::fs::write(&marker, b"ok").map_err(not_writable)?;
        if let Err(e) = std::fs::remove_file(&marker) {
            debug!(path = %marker.display(), error = %e, "Failed to remove write test file");
        }
        Ok(path)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_toml_string()?).map_err(io_err)
    }
}

/// Config file location: `$LFS_TEST_CONFIG`, else
/// `<config dir>/lfs-test/config.toml`.
pub fn config_path() -> Result<PathBuf> {
    config_path_with(&|key: &str| std::env::var(key).ok())
}

fn config_path_with(env: &dyn Fn(&str) -> Option<String>) -> Result<PathBuf> {
    if let Some(path) = env(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Ok(expand_path(&path));
    }
    let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(base.join("lfs-test").join("config.toml"))
}

fn same_host(a: &str, b: &str) -> bool {
    let short = |h: &str| h.split('.').next().unwrap_or(h).to_ascii_lowercase();
    short(a) == short(b)
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references.
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = expand_env_vars(raw);
    if expanded == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = expanded.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(expanded)
}

fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}
