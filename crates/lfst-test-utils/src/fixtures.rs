// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Write `files` (relative path, content) below `root`, creating directories.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) -> std::io::Result<()> {
    for (rel, content) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    Ok(())
}

fn runs_ok(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn git_available() -> bool {
    runs_ok("git", &["--version"])
}

pub fn git_lfs_available() -> bool {
    git_available() && runs_ok("git", &["lfs", "version"])
}

const GIT_ENV: &[&str] = &[
    "GIT_CONFIG_GLOBAL",
    "GIT_CONFIG_NOSYSTEM",
    "GIT_AUTHOR_NAME",
    "GIT_AUTHOR_EMAIL",
    "GIT_COMMITTER_NAME",
    "GIT_COMMITTER_EMAIL",
];

/// Points git at a throwaway global config for the guard's lifetime.
///
/// This mutates process environment, so tests holding it must be
/// `#[serial]`.
pub struct IsolatedGitConfig {
    _dir: tempfile::TempDir,
    config_path: PathBuf,
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl IsolatedGitConfig {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config_path = dir.path().join("gitconfig");
        fs::write(
            &config_path,
            "[user]\n\tname = LFS Test\n\temail = test@example.com\n[init]\n\tdefaultBranch = main\n",
        )?;

        let saved = GIT_ENV.iter().map(|key| (*key, std::env::var_os(key))).collect();
        std::env::set_var("GIT_CONFIG_GLOBAL", &config_path);
        std::env::set_var("GIT_CONFIG_NOSYSTEM", "1");
        for key in &GIT_ENV[2..] {
            std::env::remove_var(key);
        }

        Ok(Self {
            _dir: dir,
            config_path,
            saved,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Drop for IsolatedGitConfig {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Shell stand-in for `git-lfs`. Tracking lives in `.gitattributes` like
/// the real tool, but no filter is installed, so content is committed as
/// plain blobs and nothing is transferred.
const STUB_GIT_LFS: &str = r##"#!/bin/sh
command="$1"
[ $# -gt 0 ] && shift
if [ -n "$STUB_FAIL" ] && [ "$command" = "$STUB_FAIL" ]; then
    echo "git-lfs stub: $command failed" >&2
    exit 2
fi
case "$command" in
    version)
        echo "git-lfs/3.4.1 (stub)"
        ;;
    install|pull|migrate|ls-files)
        ;;
    track)
        for pattern in "$@"; do
            echo "$pattern filter=lfs diff=lfs merge=lfs -text" >> .gitattributes
        done
        ;;
    untrack)
        for pattern in "$@"; do
            grep -v -F "$pattern filter=lfs" .gitattributes > .gitattributes.stub || true
            mv .gitattributes.stub .gitattributes
        done
        ;;
    *)
        echo "git-lfs stub: unsupported command $command" >&2
        exit 1
        ;;
esac
"##;

/// Puts a stub `git-lfs` first on `PATH` for the guard's lifetime, so runs
/// work with plain git. `ls-files` prints nothing; pair it with a listing
/// that reads `.gitattributes` when tracking has to be reported.
///
/// This mutates process environment, so tests holding it must be
/// `#[serial]`.
pub struct StubGitLfs {
    _dir: tempfile::TempDir,
    saved_path: Option<OsString>,
}

impl StubGitLfs {
    pub fn install() -> std::io::Result<Self> {
        Self::with_failing(None)
    }

    /// Like [`StubGitLfs::install`], but `git lfs <subcommand>` exits 2.
    pub fn failing(subcommand: &str) -> std::io::Result<Self> {
        Self::with_failing(Some(subcommand))
    }

    fn with_failing(subcommand: Option<&str>) -> std::io::Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let script = STUB_GIT_LFS.replacen(
            "command=\"$1\"",
            &format!("STUB_FAIL='{}'\ncommand=\"$1\"", subcommand.unwrap_or_default()),
            1,
        );
        let path = dir.path().join("git-lfs");
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        let saved_path = std::env::var_os("PATH");
        let mut entries = vec![dir.path().to_path_buf()];
        if let Some(existing) = &saved_path {
            entries.extend(std::env::split_paths(existing));
        }
        let joined = std::env::join_paths(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        std::env::set_var("PATH", joined);
        Ok(Self {
            _dir: dir,
            saved_path,
        })
    }
}

impl Drop for StubGitLfs {
    fn drop(&mut self) {
        match &self.saved_path {
            Some(path) => std::env::set_var("PATH", path),
            None => std::env::remove_var("PATH"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("a.txt", "abcd"), ("x/y/z.bin", "")]).unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"abcd");
        assert!(dir.path().join("x/y/z.bin").is_file());
    }

    #[test]
    #[serial_test::serial]
    fn test_isolated_git_config_is_restored() {
        let before = std::env::var_os("GIT_CONFIG_GLOBAL");
        {
            let isolated = IsolatedGitConfig::new().unwrap();
            assert_eq!(
                std::env::var_os("GIT_CONFIG_GLOBAL").as_deref(),
                Some(isolated.config_path().as_os_str())
            );
            let config = fs::read_to_string(isolated.config_path()).unwrap();
            assert!(config.contains("defaultBranch = main"));
        }
        assert_eq!(std::env::var_os("GIT_CONFIG_GLOBAL"), before);
    }

    #[test]
    #[serial_test::serial]
    fn test_stub_git_lfs_tracks_in_gitattributes() {
        if !git_available() {
            println!("Skipping test_stub_git_lfs_tracks_in_gitattributes: git not installed");
            return;
        }
        let path_before = std::env::var_os("PATH");
        let repo = tempfile::tempdir().unwrap();
        {
            let _lfs = StubGitLfs::install().unwrap();
            let lfs = |args: &[&str]| {
                Command::new("git")
                    .arg("lfs")
                    .args(args)
                    .current_dir(repo.path())
                    .output()
                    .unwrap()
            };
            let version = lfs(&["version"]);
            assert!(version.status.success());
            assert!(String::from_utf8_lossy(&version.stdout).contains("(stub)"));

            assert!(lfs(&["track", "*.bin", "*.pdf"]).status.success());
            assert!(lfs(&["untrack", "*.bin"]).status.success());
            let attributes = fs::read_to_string(repo.path().join(".gitattributes")).unwrap();
            assert_eq!(attributes, "*.pdf filter=lfs diff=lfs merge=lfs -text\n");
        }
        assert_eq!(std::env::var_os("PATH"), path_before);

        let _failing = StubGitLfs::failing("ls-files").unwrap();
        assert!(runs_ok("git", &["lfs", "version"]));
        assert!(!runs_ok("git", &["lfs", "ls-files", "-n"]));
    }
}
