// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lfst_checksum::{compute_directory, diff, FileChecksum};
use lfst_config::LfstConfig;
use lfst_local_db::{
    now_timestamp, Database, NewTestRun, RepositorySizeRecord, RepositorySizeStore, RunStatus,
    RunStore,
};
use tracing::{debug, error, info, warn};

use super::workload::{Workload, SECOND_CLIENT_CONTENT, SECOND_CLIENT_FILE};
use super::{Scenario, Transport};
use crate::dispatch::{ChecksumSink, LocalSink};
use crate::error::{Error, Result};
use crate::git::{git_lfs_version, git_version, GitContext};
use crate::verify::{GitLfsListing, LfsListing, StorageReport, Verifier};

pub const RUN_COMPLETED_NOTE: &str = "All steps completed successfully";

const FIRST_REPO: &str = "repo1";
const SECOND_REPO: &str = "repo2";
const PUSH_REMOTE: &str = "origin";

/// The seven fixed steps of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Setup,
    InitialCommit,
    Modify,
    SecondClone,
    SecondClientCommit,
    FirstClientSync,
    Untrack,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Setup,
        Phase::InitialCommit,
        Phase::Modify,
        Phase::SecondClone,
        Phase::SecondClientCommit,
        Phase::FirstClientSync,
        Phase::Untrack,
    ];

    pub fn number(self) -> u32 {
        match self {
            Phase::Setup => 1,
            Phase::InitialCommit => 2,
            Phase::Modify => 3,
            Phase::SecondClone => 4,
            Phase::SecondClientCommit => 5,
            Phase::FirstClientSync => 6,
            Phase::Untrack => 7,
        }
    }

    pub fn from_number(number: u32) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.number() == number)
    }

    pub fn description(self) -> &'static str {
        match self {
            Phase::Setup => "Setup repository with LFS tracking",
            Phase::InitialCommit => "Initial commit and push",
            Phase::Modify => "Modify, delete, and rename files",
            Phase::SecondClone => "Clone to second location",
            Phase::SecondClientCommit => "Make changes on second client",
            Phase::FirstClientSync => "Pull changes to first client",
            Phase::Untrack => "Untrack files from LFS",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.number(), self.description())
    }
}

/// Filesystem locations and limits for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Each run works in `<work_root>/run-<id>`
    pub work_root: PathBuf,
    /// Holds the `v1/` and `v2/` file sets
    pub test_data: PathBuf,
    pub command_timeout: Option<Duration>,
    /// Fail step 6 when there is no way to synchronize the first client
    pub strict_sync: bool,
    /// Delete and recreate a GitHub repository that already exists
    pub force: bool,
}

impl RunOptions {
    pub fn from_config(config: &LfstConfig) -> Result<Self> {
        let test_data = config.test_data_path().ok_or_else(|| {
            Error::environment(
                "no test data directory configured",
                "Set LFS_TEST_DATA or test-data in the config file",
            )
        })?;
        Ok(Self {
            work_root: config.work_dir_path(),
            test_data,
            command_timeout: config.command_timeout(),
            strict_sync: config.strict_sync,
            force: false,
        })
    }
}

/// Working directory of run `run_id` below `work_root`.
pub fn run_dir(work_root: &Path, run_id: i64) -> PathBuf {
    work_root.join(format!("run-{}", run_id))
}

/// The two client repositories inside a run directory.
pub fn repository_dirs(run_dir: &Path) -> [(&'static str, PathBuf); 2] {
    [
        (FIRST_REPO, run_dir.join(FIRST_REPO)),
        (SECOND_REPO, run_dir.join(SECOND_REPO)),
    ]
}

struct RunState {
    run_id: i64,
    git: GitContext,
    verifier: Verifier,
    run_dir: PathBuf,
    repo1: PathBuf,
    repo2: PathBuf,
    /// Remote configured on the first repository for pushes
    push_remote: Option<String>,
    snapshots: BTreeMap<u32, Vec<FileChecksum>>,
}

/// Executes one scenario end to end against real git and git-lfs.
pub struct ScenarioRunner {
    scenario: Scenario,
    db: Arc<Database>,
    options: RunOptions,
    workload: Workload,
    sink: Arc<dyn ChecksumSink>,
    listing: Option<Arc<dyn LfsListing>>,
}

impl ScenarioRunner {
    pub fn new(scenario: Scenario, db: Arc<Database>, options: RunOptions) -> Self {
        Self {
            sink: Arc::new(LocalSink::new(db.clone())),
            scenario,
            db,
            options,
            workload: Workload::default(),
            listing: None,
        }
    }

    pub fn with_workload(mut self, workload: Workload) -> Self {
        self.workload = workload;
        self
    }

    /// Send snapshots somewhere other than the run's own store.
    pub fn with_sink(mut self, sink: Arc<dyn ChecksumSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override how LFS-tracked files are listed during verification.
    pub fn with_listing(mut self, listing: Arc<dyn LfsListing>) -> Self {
        self.listing = Some(listing);
        self
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Tools and test data a run needs. Nothing is recorded on failure.
    pub async fn check_prerequisites(&self) -> Result<()> {
        let git = git_version().await?;
        debug!(version = %git, "git is available");
        let lfs = git_lfs_version().await?;
        debug!(version = %lfs, "git-lfs is available");
        self.workload.validate(&self.options.test_data)?;
        info!(test_data = %self.options.test_data.display(), "Prerequisites satisfied");
        Ok(())
    }

    /// Run all seven steps and return the run id.
    ///
    /// Once the run exists, any failure (including store errors) marks it
    /// failed, removes its working directory and is returned as
    /// [`Error::PhaseFailed`].
    pub async fn execute(&self) -> Result<i64> {
        self.check_prerequisites().await?;

        let run_id = self.create_run()?;
        let timeout = self.options.command_timeout;
        let git = GitContext::for_run(self.db.clone(), run_id, timeout);
        let listing = self
            .listing
            .clone()
            .unwrap_or_else(|| Arc::new(GitLfsListing::new(Clone::clone(&git))));
        let run_dir = run_dir(&self.options.work_root, run_id);
        let mut state = RunState {
            run_id,
            git,
            verifier: Verifier::new(listing),
            repo1: run_dir.join(FIRST_REPO),
            repo2: run_dir.join(SECOND_REPO),
            run_dir,
            push_remote: None,
            snapshots: BTreeMap::new(),
        };

        if let Err(e) = self.record_work_dir(&state) {
            return Err(self.fail(&state, Phase::Setup, e).await);
        }
        info!(
            run_id,
            scenario = self.scenario.id,
            name = %self.scenario.name,
            work_dir = %state.run_dir.display(),
            "Created test run"
        );

        for phase in Phase::ALL {
            match self.is_running(run_id) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(run_id, step = phase.number(), "Run is no longer running, stopping");
                    return Err(Error::Cancelled { run_id });
                }
                Err(e) => return Err(self.fail(&state, phase, e).await),
            }
            state.git.set_step(phase.number());
            info!(run_id, step = phase.number(), "Starting {}", phase.description());
            let started = Instant::now();

            if let Err(e) = self.run_phase(phase, &mut state).await {
                return Err(self.fail(&state, phase, e).await);
            }
            info!(
                run_id,
                step = phase.number(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Step complete"
            );
        }

        let finished = self.db.lock().and_then(|conn| {
            RunStore::new(&conn).finish(run_id, RunStatus::Completed, Some(RUN_COMPLETED_NOTE))
        });
        match finished {
            Ok(true) => {}
            Ok(false) => return Err(Error::Cancelled { run_id }),
            Err(e) => return Err(self.fail(&state, Phase::Untrack, e.into()).await),
        }
        info!(run_id, scenario = self.scenario.id, "Scenario complete");
        Ok(run_id)
    }

    fn record_work_dir(&self, state: &RunState) -> Result<()> {
        let conn = self.db.lock()?;
        RunStore::new(&conn).set_work_dir(state.run_id, &state.run_dir.to_string_lossy())?;
        Ok(())
    }

    fn create_run(&self) -> Result<i64> {
        let conn = self.db.lock()?;
        let run_id = RunStore::new(&conn).insert(&NewTestRun {
            scenario_id: i64::from(self.scenario.id),
            server_type: self.scenario.server_type.clone(),
            protocol: self.scenario.protocol.to_string(),
            git_server: self.scenario.git_server.to_string(),
            pid: i64::from(std::process::id()),
            work_dir: None,
            notes: format!("Automated execution of scenario {}", self.scenario.id),
        })?;
        Ok(run_id)
    }

    fn is_running(&self, run_id: i64) -> Result<bool> {
        let conn = self.db.lock()?;
        Ok(RunStore::new(&conn).require(run_id)?.status == RunStatus::Running)
    }

    /// Mark the run failed, clean up, and wrap `error` with the step.
    async fn fail(&self, state: &RunState, phase: Phase, error: Error) -> Error {
        let run_id = state.run_id;
        error!(run_id, step = phase.number(), error = %error, "Step failed");

        let note = format!("Failed at step {}: {}", phase.number(), error);
        let marked = self
            .db
            .lock()
            .and_then(|conn| RunStore::new(&conn).finish(run_id, RunStatus::Failed, Some(&note)));

        remove_run_dir(&state.run_dir).await;

        match marked {
            Ok(true) => Error::PhaseFailed {
                run_id,
                phase: phase.number(),
                source: Box::new(error),
            },
            Ok(false) => {
                warn!(
                    run_id,
                    step = phase.number(),
                    error = %error,
                    "Run was finished by another process while step was failing"
                );
                Error::Cancelled { run_id }
            }
            Err(e) => {
                warn!(run_id, error = %e, "Failed to mark run as failed");
                Error::PhaseFailed {
                    run_id,
                    phase: phase.number(),
                    source: Box::new(error),
                }
            }
        }
    }

    async fn run_phase(&self, phase: Phase, state: &mut RunState) -> Result<()> {
        match phase {
            Phase::Setup => self.setup(state).await,
            Phase::InitialCommit => self.initial_commit(state).await,
            Phase::Modify => self.modify(state).await,
            Phase::SecondClone => self.second_clone(state).await,
            Phase::SecondClientCommit => self.second_client_commit(state).await,
            Phase::FirstClientSync => self.first_client_sync(state).await,
            Phase::Untrack => self.untrack(state).await,
        }
    }

    async fn setup(&self, state: &mut RunState) -> Result<()> {
        let repo = state.repo1.clone();
        tokio::fs::create_dir_all(&repo).await?;
        state.git.init(&repo).await?;
        state.git.config_user(&repo).await?;

        if let (true, Some(name)) = (self.scenario.uses_github(), &self.scenario.repo_name) {
            let url = state.git.gh_repo_create(name, self.options.force).await?;
            state.git.add_remote(&repo, PUSH_REMOTE, &url).await?;
            state.push_remote = Some(PUSH_REMOTE.to_string());
        }

        state.git.lfs_install(&repo).await?;
        if let Some(url) = &self.scenario.server_url {
            state.git.configure_lfs_url(&repo, url).await?;
        }
        state.git.lfs_track(&repo, &self.workload.patterns).await?;

        tokio::fs::write(repo.join("README.md"), evaluation_readme(&self.scenario)).await?;
        let bytes = self
            .workload
            .materialize_initial(&self.options.test_data, &repo)
            .await?;
        info!(
            run_id = state.run_id,
            files = self.workload.initial.len(),
            size = %lfst_checksum::format_size(bytes),
            "Copied initial test files"
        );

        self.snapshot(state, Phase::Setup, &repo).await?;
        Ok(())
    }

    async fn initial_commit(&self, state: &mut RunState) -> Result<()> {
        let repo = state.repo1.clone();
        state.git.add(&repo, ["."]).await?;
        state.git.commit(&repo, "Initial commit with LFS files").await?;
        self.push_if_remote(state, &repo).await?;
        self.snapshot(state, Phase::InitialCommit, &repo).await?;

        let report = state
            .verifier
            .verify_all(&repo, &self.workload.tracked_after_commit())
            .await?;
        self.record_sizes(state, FIRST_REPO, &report)?;
        Ok(())
    }

    async fn modify(&self, state: &mut RunState) -> Result<()> {
        let repo = state.repo1.clone();
        self.workload
            .apply_transform(&self.options.test_data, &repo)
            .await?;
        state.git.add_all(&repo).await?;
        state
            .git
            .commit(&repo, "Update, delete, and rename files (v2)")
            .await?;
        self.push_if_remote(state, &repo).await?;
        self.snapshot(state, Phase::Modify, &repo).await?;
        Ok(())
    }

    async fn second_clone(&self, state: &mut RunState) -> Result<()> {
        let source = self.clone_source(state).await?;
        let repo = state.repo2.clone();
        info!(run_id = state.run_id, source = %source, "Cloning second client");
        state.git.clone(&source, &repo).await?;
        state.git.config_user(&repo).await?;
        state.git.lfs_install(&repo).await?;
        state.git.lfs_pull(&repo).await?;

        let cloned = self.snapshot(state, Phase::SecondClone, &repo).await?;
        self.require_match(state, Phase::Modify, Phase::SecondClone, &cloned)?;

        let report = state
            .verifier
            .verify_all(&repo, &self.workload.tracked_after_transform())
            .await?;
        self.record_sizes(state, SECOND_REPO, &report)?;
        Ok(())
    }

    async fn second_client_commit(&self, state: &mut RunState) -> Result<()> {
        let repo = state.repo2.clone();
        tokio::fs::write(repo.join(SECOND_CLIENT_FILE), SECOND_CLIENT_CONTENT).await?;
        state.git.add(&repo, [SECOND_CLIENT_FILE]).await?;
        state
            .git
            .commit(&repo, "Add README from second client")
            .await?;
        if state.push_remote.is_some() {
            state.git.push(&repo, PUSH_REMOTE).await?;
        }
        self.snapshot(state, Phase::SecondClientCommit, &repo).await?;
        Ok(())
    }

    async fn first_client_sync(&self, state: &mut RunState) -> Result<()> {
        let repo = state.repo1.clone();
        let source = match (self.scenario.protocol, &state.push_remote) {
            (Transport::Local, _) => Some(state.repo2.to_string_lossy().into_owned()),
            (_, Some(remote)) => Some(remote.clone()),
            _ => None,
        };

        let synced = match source {
            Some(source) => {
                state.git.pull(&repo, &source).await?;
                true
            }
            None if self.options.strict_sync => {
                return Err(Error::SyncUnavailable(format!(
                    "scenario {} over {}",
                    self.scenario.id, self.scenario.protocol
                )));
            }
            None => {
                warn!(
                    run_id = state.run_id,
                    protocol = %self.scenario.protocol,
                    "No synchronization transport, step 6 snapshot will not be compared with step 5"
                );
                let conn = self.db.lock()?;
                RunStore::new(&conn).append_note(
                    state.run_id,
                    "Step 6: no synchronization transport, comparison with step 5 skipped",
                )?;
                false
            }
        };

        let pulled = self.snapshot(state, Phase::FirstClientSync, &repo).await?;
        if synced {
            self.require_match(state, Phase::SecondClientCommit, Phase::FirstClientSync, &pulled)?;
        }
        Ok(())
    }

    async fn untrack(&self, state: &mut RunState) -> Result<()> {
        let repo = state.repo1.clone();
        state.git.lfs_untrack(&repo, &self.workload.patterns).await?;
        state.git.add(&repo, [".gitattributes"]).await?;
        state.git.commit(&repo, "Untrack files from LFS").await?;
        state.git.lfs_migrate_export(&repo).await?;
        self.snapshot(state, Phase::Untrack, &repo).await?;
        state
            .verifier
            .verify_not_tracked(&repo, &self.workload.tracked_after_transform())
            .await?;
        Ok(())
    }

    async fn push_if_remote(&self, state: &RunState, repo: &Path) -> Result<()> {
        if let Some(remote) = &state.push_remote {
            state.git.push(repo, remote).await?;
        }
        Ok(())
    }

    async fn clone_source(&self, state: &RunState) -> Result<String> {
        if self.scenario.protocol == Transport::Local {
            return Ok(state.repo1.to_string_lossy().into_owned());
        }
        if let Some(remote) = &state.push_remote {
            if let Some(url) = state.git.remote_url(&state.repo1, remote).await {
                return Ok(url);
            }
        }
        self.scenario.server_url.clone().ok_or_else(|| {
            Error::environment(
                format!("no remote URL configured for cloning scenario {}", self.scenario.id),
                "Use a local scenario or one with a git remote",
            )
        })
    }

    /// Fingerprint `dir`, submit it through the sink and keep it for diffs.
    async fn snapshot(
        &self,
        state: &mut RunState,
        phase: Phase,
        dir: &Path,
    ) -> Result<Vec<FileChecksum>> {
        let root = dir.to_path_buf();
        let checksums = tokio::task::spawn_blocking(move || compute_directory(&root)).await??;
        let stored = self
            .sink
            .submit(state.run_id, phase.number(), &checksums)
            .await?;
        info!(
            run_id = state.run_id,
            step = phase.number(),
            files = checksums.len(),
            stored,
            destination = %self.sink.describe(),
            "Recorded snapshot"
        );
        state.snapshots.insert(phase.number(), checksums.clone());
        Ok(checksums)
    }

    fn require_match(
        &self,
        state: &RunState,
        expected: Phase,
        actual: Phase,
        snapshot: &[FileChecksum],
    ) -> Result<()> {
        let baseline = state
            .snapshots
            .get(&expected.number())
            .map(Vec::as_slice)
            .unwrap_or_default();
        compare_snapshots(expected, actual, baseline, snapshot)?;
        info!(
            run_id = state.run_id,
            from = expected.number(),
            to = actual.number(),
            files = snapshot.len(),
            "Checksums match"
        );
        Ok(())
    }

    fn record_sizes(&self, state: &RunState, repo: &str, report: &StorageReport) -> Result<()> {
        let measured_at = now_timestamp();
        let step_number = state.git.step();
        let conn = self.db.lock()?;
        let store = RepositorySizeStore::new(&conn);
        for (location, size, count) in [
            ("objects", report.git_bytes, report.git_objects),
            ("lfs/objects", report.lfs_bytes, report.lfs_objects),
        ] {
            store.insert(&RepositorySizeRecord {
                run_id: state.run_id,
                step_number,
                location: format!("{}/.git/{}", repo, location),
                size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
                file_count: i64::try_from(count).ok(),
                measured_at: measured_at.clone(),
            })?;
        }
        Ok(())
    }
}

/// `snapshot` taken at `actual` must equal `baseline` taken at `expected`.
fn compare_snapshots(
    expected: Phase,
    actual: Phase,
    baseline: &[FileChecksum],
    snapshot: &[FileChecksum],
) -> Result<()> {
    let differences = diff(baseline, snapshot);
    if differences.is_empty() {
        return Ok(());
    }
    Err(Error::SnapshotMismatch {
        from: expected.number(),
        to: actual.number(),
        differences,
    })
}

/// Remove a run directory. Failures are only logged.
pub(crate) async fn remove_run_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => info!(dir = %dir.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove working directory"),
    }
}

fn evaluation_readme(scenario: &Scenario) -> String {
    let mut text = format!(
        "# Git LFS Evaluation Repository\n\n\
         This repository is used for evaluating Git LFS server implementations.\n\n\
         ## Scenario Information\n\n\
         - **Scenario ID**: {}\n\
         - **Name**: {}\n\
         - **Server Type**: {}\n\
         - **Protocol**: {}\n\
         - **Git Server**: {}\n",
        scenario.id, scenario.name, scenario.server_type, scenario.protocol, scenario.git_server
    );
    if let Some(url) = &scenario.server_url {
        text.push_str(&format!("- **Server URL**: {}\n", url));
    }
    text.push_str("\n## Evaluation Procedure\n\n");
    for phase in Phase::ALL {
        text.push_str(&format!("{}. {}\n", phase.number(), phase.description()));
    }
    text.push_str("\n---\nGenerated automatically by `lfst scenario run`.\n");
    text
}
