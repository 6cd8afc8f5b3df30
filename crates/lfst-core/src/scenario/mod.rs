// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scenario definitions and the seven-phase runner.

mod runner;
mod workload;

pub(crate) use runner::remove_run_dir;
pub use runner::{
    repository_dirs, run_dir, Phase, RunOptions, ScenarioRunner, RUN_COMPLETED_NOTE,
};
pub use workload::{Workload, WorkloadFile, SECOND_CLIENT_CONTENT, SECOND_CLIENT_FILE};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the git remote and LFS server are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Local,
    Ssh,
    Http,
    Https,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Local => "local",
            Transport::Ssh => "ssh",
            Transport::Http => "http",
            Transport::Https => "https",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Transport::Local),
            "ssh" => Ok(Transport::Ssh),
            "http" => Ok(Transport::Http),
            "https" => Ok(Transport::Https),
            other => Err(Error::environment(
                format!("unknown transport {:?}", other),
                "use one of local, ssh, http, https",
            )),
        }
    }
}

/// Where the git history itself is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitHosting {
    Bare,
    Github,
}

impl GitHosting {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitHosting::Bare => "bare",
            GitHosting::Github => "github",
        }
    }
}

impl fmt::Display for GitHosting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One numbered server/transport/hosting combination under evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: u32,
    pub name: String,
    /// `bare`, `lfs-test-server`, `giftless` or `rudolfs`
    pub server_type: String,
    pub protocol: Transport,
    pub git_server: GitHosting,
    /// LFS endpoint written to `.lfsconfig`
    pub server_url: Option<String>,
    /// GitHub `owner/name`, used when `git_server` is GitHub
    pub repo_name: Option<String>,
}

impl Scenario {
    fn builtin(
        id: u32,
        name: &str,
        server_type: &str,
        protocol: Transport,
        git_server: GitHosting,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            server_type: server_type.to_string(),
            protocol,
            git_server,
            server_url: None,
            repo_name: None,
        }
    }

    fn with_server_url(mut self, url: &str) -> Self {
        self.server_url = Some(url.to_string());
        self
    }

    fn with_repo_name(mut self, name: &str) -> Self {
        self.repo_name = Some(name.to_string());
        self
    }

    /// Whether phase 1 creates a GitHub repository and pushes to it.
    pub fn uses_github(&self) -> bool {
        self.git_server == GitHosting::Github && self.repo_name.is_some()
    }
}

/// All built-in scenarios, ordered by id.
pub fn catalog() -> Vec<Scenario> {
    use GitHosting::*;
    use Transport::*;
    vec![
        Scenario::builtin(1, "Bare repo - local", "bare", Local, Bare),
        Scenario::builtin(2, "Bare repo - SSH", "bare", Ssh, Bare),
        Scenario::builtin(6, "LFS Test Server - HTTP", "lfs-test-server", Http, Bare)
            .with_server_url("http://gojira:8080"),
        Scenario::builtin(7, "LFS Test Server - HTTP/GitHub", "lfs-test-server", Http, Github)
            .with_server_url("http://gojira:8080")
            .with_repo_name("mslinn/lfs-eval-test"),
        Scenario::builtin(8, "Giftless - local", "giftless", Local, Bare),
        Scenario::builtin(9, "Giftless - SSH", "giftless", Ssh, Bare),
        Scenario::builtin(13, "Rudolfs - local", "rudolfs", Local, Bare),
        Scenario::builtin(14, "Rudolfs - SSH", "rudolfs", Ssh, Bare),
    ]
}

pub fn find(id: u32) -> Result<Scenario> {
    catalog()
        .into_iter()
        .find(|s| s.id == id)
        .ok_or(Error::UnknownScenario(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids_are_unique_and_sorted() {
        let ids: Vec<u32> = catalog().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 6, 7, 8, 9, 13, 14]);
    }

    #[test]
    fn test_find() {
        let s = find(7).unwrap();
        assert_eq!(s.server_type, "lfs-test-server");
        assert_eq!(s.protocol, Transport::Http);
        assert_eq!(s.server_url.as_deref(), Some("http://gojira:8080"));
        assert!(s.uses_github());
        assert!(!find(1).unwrap().uses_github());
        assert!(matches!(find(3), Err(Error::UnknownScenario(3))));
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("ssh".parse::<Transport>().unwrap(), Transport::Ssh);
        assert!("ftp".parse::<Transport>().is_err());
        assert_eq!(Transport::Https.to_string(), "https");
    }
}
