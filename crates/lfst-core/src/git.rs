// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Git, Git LFS and GitHub CLI operations used by the scenario phases.
//!
//! When bound to a run, every invocation is also written to the
//! `operations` table with its kind tag, step and duration.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lfst_local_db::{format_timestamp, Database, OperationRecord, OperationStatus, OperationStore};
use tracing::{info, warn};

use crate::command::{run, CommandOutput, CommandSpec};
use crate::error::{Error, Result};

pub const DEFAULT_USER_NAME: &str = "LFS Test";
pub const DEFAULT_USER_EMAIL: &str = "test@example.com";

/// Runs git commands for one run, recording each as an operation.
///
/// Clones share the current step, so a listing built from a clone records
/// under whatever step the run has reached.
#[derive(Clone)]
pub struct GitContext {
    recorder: Option<(Arc<Database>, i64)>,
    step: Arc<AtomicU32>,
    timeout: Option<Duration>,
}

impl GitContext {
    /// A context that records nothing.
    pub fn detached(timeout: Option<Duration>) -> Self {
        Self {
            recorder: None,
            step: Arc::new(AtomicU32::new(0)),
            timeout,
        }
    }

    pub fn for_run(db: Arc<Database>, run_id: i64, timeout: Option<Duration>) -> Self {
        Self {
            recorder: Some((db, run_id)),
            step: Arc::new(AtomicU32::new(0)),
            timeout,
        }
    }

    pub fn set_step(&self, step: u32) {
        self.step.store(step, Ordering::Relaxed);
    }

    pub fn step(&self) -> u32 {
        self.step.load(Ordering::Relaxed)
    }

    async fn exec(&self, kind: &str, spec: CommandSpec) -> Result<CommandOutput> {
        let output = self.exec_unchecked(kind, spec).await;
        output.into_result()
    }

    /// Run and record without treating failure as an error.
    async fn exec_unchecked(&self, kind: &str, spec: CommandSpec) -> CommandOutput {
        let output = run(&spec.timeout(self.timeout)).await;
        if let Some((db, run_id)) = &self.recorder {
            record_operation(db, *run_id, self.step(), kind, &output);
        }
        output
    }

    fn git(dir: &Path) -> CommandSpec {
        CommandSpec::new("git").current_dir(dir)
    }

    pub async fn init(&self, repo: &Path) -> Result<()> {
        self.exec("init", Self::git(repo).args(["init", "-b", "main"])).await?;
        Ok(())
    }

    pub async fn config_user(&self, repo: &Path) -> Result<()> {
        self.exec(
            "config",
            Self::git(repo).args(["config", "user.name", DEFAULT_USER_NAME]),
        )
        .await?;
        self.exec(
            "config",
            Self::git(repo).args(["config", "user.email", DEFAULT_USER_EMAIL]),
        )
        .await?;
        Ok(())
    }

    pub async fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<()> {
        self.exec("remote-add", Self::git(repo).args(["remote", "add", name, url]))
            .await?;
        Ok(())
    }

    /// URL of remote `name`; `None` when it is not configured.
    pub async fn remote_url(&self, repo: &Path, name: &str) -> Option<String> {
        let out = self
            .exec_unchecked("remote-get-url", Self::git(repo).args(["remote", "get-url", name]))
            .await;
        out.success().then(|| out.stdout.trim().to_string()).filter(|u| !u.is_empty())
    }

    pub async fn lfs_install(&self, repo: &Path) -> Result<()> {
        self.exec("lfs-install", Self::git(repo).args(["lfs", "install", "--local"]))
            .await?;
        Ok(())
    }

    /// Point LFS at an explicit server by writing `.lfsconfig`.
    pub async fn configure_lfs_url(&self, repo: &Path, url: &str) -> Result<()> {
        let content = format!("[lfs]\n\turl = {}\n", url);
        tokio::fs::write(repo.join(".lfsconfig"), content).await?;
        info!(repo = %repo.display(), url, "Configured LFS server URL");
        Ok(())
    }

    pub async fn lfs_track(&self, repo: &Path, patterns: &[String]) -> Result<()> {
        self.exec(
            "lfs-track",
            Self::git(repo).args(["lfs", "track"]).args(patterns.iter().cloned()),
        )
        .await?;
        Ok(())
    }

    pub async fn lfs_untrack(&self, repo: &Path, patterns: &[String]) -> Result<()> {
        self.exec(
            "lfs-untrack",
            Self::git(repo).args(["lfs", "untrack"]).args(patterns.iter().cloned()),
        )
        .await?;
        Ok(())
    }

    pub async fn add<I, S>(&self, repo: &Path, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec("add", Self::git(repo).arg("add").args(paths)).await?;
        Ok(())
    }

    pub async fn add_all(&self, repo: &Path) -> Result<()> {
        self.exec("add", Self::git(repo).args(["add", "-A"])).await?;
        Ok(())
    }

    pub async fn commit(&self, repo: &Path, message: &str) -> Result<()> {
        self.exec("commit", Self::git(repo).args(["commit", "-m", message]))
            .await?;
        Ok(())
    }

    pub async fn push(&self, repo: &Path, remote: &str) -> Result<()> {
        self.exec("push", Self::git(repo).args(["push", "-u", remote, "HEAD"]))
            .await?;
        Ok(())
    }

    /// Fast-forward the current branch from `source`, a remote name or path.
    pub async fn pull(&self, repo: &Path, source: &str) -> Result<()> {
        self.exec("pull", Self::git(repo).args(["pull", "--ff-only", source, "HEAD"]))
            .await?;
        Ok(())
    }

    /// Clone `source` into `dest`, replacing anything already there.
    pub async fn clone(&self, source: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            tokio::fs::remove_dir_all(dest).await?;
        }
        let parent = dest
            .parent()
            .ok_or_else(|| Error::environment("clone destination has no parent", "use an absolute path"))?;
        tokio::fs::create_dir_all(parent).await?;
        let dest_str = dest.to_string_lossy().into_owned();
        self.exec(
            "clone",
            CommandSpec::new("git").current_dir(parent).args(["clone", source, &dest_str]),
        )
        .await?;
        Ok(())
    }

    /// Download and check out LFS content for the current ref.
    pub async fn lfs_pull(&self, repo: &Path) -> Result<()> {
        self.exec("lfs-pull", Self::git(repo).args(["lfs", "pull"])).await?;
        Ok(())
    }

    /// Rewrite history so every file is stored as a plain git blob.
    pub async fn lfs_migrate_export(&self, repo: &Path) -> Result<()> {
        self.exec(
            "lfs-migrate",
            Self::git(repo).args(["lfs", "migrate", "export", "--include=*", "--everything"]),
        )
        .await?;
        Ok(())
    }

    /// Paths git-lfs reports as tracked (`git lfs ls-files -n`).
    pub async fn lfs_ls_files(&self, repo: &Path) -> Result<Vec<String>> {
        let out = self
            .exec("lfs-ls-files", Self::git(repo).args(["lfs", "ls-files", "-n"]))
            .await?;
        Ok(parse_lines(&out.stdout))
    }

    /// Working tree entries including ignored ones, as `(status, path)`.
    pub async fn status_porcelain(&self, repo: &Path) -> Result<Vec<(String, String)>> {
        let out = self
            .exec(
                "status",
                Self::git(repo).args(["status", "--porcelain", "--ignored", "--untracked-files=all"]),
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| (l[..2].to_string(), l[3..].trim_matches('"').to_string()))
            .collect())
    }

    /// Create a private GitHub repository with the `gh` CLI and return its
    /// clone URL. With `force`, an existing repository is deleted first.
    pub async fn gh_repo_create(&self, repo_name: &str, force: bool) -> Result<String> {
        version_of(
            CommandSpec::new("gh").arg("--version"),
            "Install the GitHub CLI (gh) and run `gh auth login`",
        )
        .await?;
        if force {
            let deleted = run(&CommandSpec::new("gh")
                .args(["repo", "delete", repo_name, "--yes"])
                .timeout(self.timeout))
            .await;
            if deleted.success() {
                info!(repo = repo_name, "Deleted existing GitHub repository");
            }
        }
        self.exec(
            "gh-create-repo",
            CommandSpec::new("gh").args(["repo", "create", repo_name, "--private"]),
        )
        .await?;
        Ok(format!("https://github.com/{}.git", repo_name))
    }
}

/// Write one finished command to the `operations` table. A store error is
/// logged and swallowed so it never masks the command's own outcome.
pub(crate) fn record_operation(
    db: &Database,
    run_id: i64,
    step: u32,
    kind: &str,
    output: &CommandOutput,
) {
    let started = Utc::now() - chrono::Duration::milliseconds(output.duration_ms);
    let record = OperationRecord {
        id: 0,
        run_id,
        step_number: step,
        operation: kind.to_string(),
        started_at: format_timestamp(started),
        duration_ms: output.duration_ms,
        file_count: None,
        total_bytes: None,
        status: if output.success() {
            OperationStatus::Success
        } else {
            OperationStatus::Failed
        },
        error: output.failure_message(),
    };
    let result = db
        .lock()
        .and_then(|conn| OperationStore::new(&conn).insert(&record));
    if let Err(e) = result {
        warn!(run_id, operation = kind, error = %e, "Failed to record operation");
    }
}

fn parse_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// `git --version` output, or an environment error naming the fix.
pub async fn git_version() -> Result<String> {
    version_of(CommandSpec::new("git").arg("--version"), "Install git").await
}

pub async fn git_lfs_version() -> Result<String> {
    version_of(
        CommandSpec::new("git").args(["lfs", "version"]),
        "Install git-lfs and run `git lfs install`",
    )
    .await
}

async fn version_of(spec: CommandSpec, remediation: &str) -> Result<String> {
    let out = run(&spec.timeout(Some(Duration::from_secs(30)))).await;
    if out.success() {
        Ok(out.stdout.trim().to_string())
    } else {
        Err(Error::environment(
            format!(
                "{} is not available ({})",
                out.command,
                out.failure_message().unwrap_or_default()
            ),
            remediation,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lines_skips_blanks() {
        assert_eq!(
            parse_lines("a.pdf\n\n  dir/b.mov \n"),
            vec!["a.pdf".to_string(), "dir/b.mov".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_operation_is_recorded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let run_id = {
            let conn = db.lock().unwrap();
            lfst_local_db::RunStore::new(&conn)
                .insert(&lfst_local_db::NewTestRun {
                    scenario_id: 1,
                    server_type: "bare".into(),
                    protocol: "local".into(),
                    git_server: "bare".into(),
                    pid: 0,
                    work_dir: None,
                    notes: String::new(),
                })
                .unwrap()
        };
        let ctx = GitContext::for_run(db.clone(), run_id, None);
        ctx.set_step(3);
        let dir = tempfile::tempdir().unwrap();
        // Not a repository, so commit fails
        let err = ctx.commit(&dir.path().join("missing"), "msg").await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. } | Error::Spawn { .. }));

        let conn = db.lock().unwrap();
        let ops = OperationStore::new(&conn).list(run_id, Some(3)).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, "commit");
        assert_eq!(ops[0].status, OperationStatus::Failed);
        assert!(ops[0].error.is_some());
    }

    #[tokio::test]
    async fn test_listing_and_lookup_failures_are_recorded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let run_id = {
            let conn = db.lock().unwrap();
            lfst_local_db::RunStore::new(&conn).ensure_placeholder(7, "test").unwrap();
            7
        };
        let ctx = GitContext::for_run(db.clone(), run_id, None);
        // A clone records under the step set on the original
        let listing_ctx = Clone::clone(&ctx);
        ctx.set_step(2);
        let dir = tempfile::tempdir().unwrap();
        let not_a_repo = dir.path();

        assert!(listing_ctx.lfs_ls_files(not_a_repo).await.is_err());
        assert_eq!(ctx.remote_url(not_a_repo, "origin").await, None);

        let conn = db.lock().unwrap();
        let ops = OperationStore::new(&conn).list(run_id, Some(2)).unwrap();
        let kinds: Vec<&str> = ops.iter().map(|op| op.operation.as_str()).collect();
        assert_eq!(kinds, vec!["lfs-ls-files", "remote-get-url"]);
        assert!(ops.iter().all(|op| op.status == OperationStatus::Failed));
    }
}
