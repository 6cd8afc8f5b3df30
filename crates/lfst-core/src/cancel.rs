// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Out-of-band cancellation of running scenarios.
//!
//! Coordination happens only through the recorded process id and the run's
//! status row, so cancellation works from any other `lfst` invocation.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lfst_local_db::{Database, RunStatus, RunStore};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, getpid, setpgid, Pid};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::scenario::remove_run_dir;

pub const CANCELLED_NOTE: &str = "Cancelled by user";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Run(i64),
    AllRunning,
}

impl CancelTarget {
    /// `all` or a run id.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("all") {
            return Some(CancelTarget::AllRunning);
        }
        value.trim().parse().ok().map(CancelTarget::Run)
    }
}

/// What happened to the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// No live process with the recorded id
    NoProcess,
    /// Exited within the grace interval after SIGTERM
    Terminated,
    /// Still alive after the grace interval and sent SIGKILL
    Killed,
    /// The recorded id is this process
    SkippedSelf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled { run_id: i64, signal: SignalOutcome },
    /// Already finished; nothing was changed
    NotRunning { run_id: i64, status: RunStatus },
}

pub fn cancelled_count(outcomes: &[CancelOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, CancelOutcome::Cancelled { .. }))
        .count()
}

pub struct Canceller {
    db: Arc<Database>,
    grace: Duration,
}

impl Canceller {
    pub fn new(db: Arc<Database>, grace: Duration) -> Self {
        Self { db, grace }
    }

    pub async fn cancel(&self, target: CancelTarget) -> Result<Vec<CancelOutcome>> {
        match target {
            CancelTarget::Run(run_id) => Ok(vec![self.cancel_run(run_id).await?]),
            CancelTarget::AllRunning => {
                let running = {
                    let conn = self.db.lock()?;
                    RunStore::new(&conn).list(Some(RunStatus::Running))?
                };
                info!(count = running.len(), "Cancelling all running runs");
                let mut outcomes = Vec::with_capacity(running.len());
                for run in running {
                    outcomes.push(self.cancel_run(run.id).await?);
                }
                Ok(outcomes)
            }
        }
    }

    /// Stop run `run_id`. Cancelling a finished run is a reported no-op.
    pub async fn cancel_run(&self, run_id: i64) -> Result<CancelOutcome> {
        let run = {
            let conn = self.db.lock()?;
            RunStore::new(&conn).require(run_id)?
        };
        if run.status != RunStatus::Running {
            info!(run_id, status = %run.status, "Run is not running, nothing to cancel");
            return Ok(CancelOutcome::NotRunning {
                run_id,
                status: run.status,
            });
        }

        let signal = terminate(run.pid, self.grace).await;
        info!(run_id, pid = run.pid, ?signal, "Signalled run process");

        if let Some(dir) = run.work_dir.as_deref().filter(|d| !d.is_empty()) {
            remove_run_dir(Path::new(dir)).await;
        }

        let conn = self.db.lock()?;
        let runs = RunStore::new(&conn);
        if runs.finish(run_id, RunStatus::Cancelled, Some(CANCELLED_NOTE))? {
            info!(run_id, "Run cancelled");
            Ok(CancelOutcome::Cancelled { run_id, signal })
        } else {
            // Finished on its own while we were signalling
            let status = runs.require(run_id)?.status;
            Ok(CancelOutcome::NotRunning { run_id, status })
        }
    }
}

/// Put the calling process in a fresh process group it leads, so
/// cancellation can signal every git and git-lfs child along with it.
pub fn lead_process_group() -> Result<()> {
    let me = getpid();
    if matches!(getpgid(None), Ok(pgid) if pgid == me) {
        return Ok(());
    }
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(|e| {
        Error::environment(
            format!("cannot create a process group for pid {}: {}", me, e),
            "Cancelling this run may leave its git processes running",
        )
    })?;
    debug!(pid = me.as_raw(), "Leading a new process group");
    Ok(())
}

/// SIGTERM the process tree, wait up to `grace`, then SIGKILL what is left.
///
/// A process leading its own group is signalled through the group.
/// Descendants are collected before the first signal, since they are
/// reparented once their parent dies, and are signalled individually.
async fn terminate(pid: i64, grace: Duration) -> SignalOutcome {
    let Ok(raw) = i32::try_from(pid) else {
        return SignalOutcome::NoProcess;
    };
    if raw <= 0 {
        return SignalOutcome::NoProcess;
    }
    if u32::try_from(raw).ok() == Some(std::process::id()) {
        warn!(pid, "Refusing to signal the current process");
        return SignalOutcome::SkippedSelf;
    }

    let target = Pid::from_raw(raw);
    let group = matches!(getpgid(Some(target)), Ok(pgid) if pgid == target);
    let descendants = descendants(target);
    debug!(pid, group, descendants = descendants.len(), "Terminating process tree");

    match send(target, group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            debug!(pid, "Process already exited");
            signal_each(&descendants, Signal::SIGKILL);
            return SignalOutcome::NoProcess;
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to send SIGTERM");
        }
    }
    signal_each(&descendants, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(target) && !descendants.iter().any(|p| is_alive(*p)) {
            return SignalOutcome::Terminated;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    let survivors: Vec<Pid> = descendants.into_iter().filter(|p| is_alive(*p)).collect();
    if !is_alive(target) && survivors.is_empty() {
        return SignalOutcome::Terminated;
    }

    warn!(
        pid,
        survivors = survivors.len(),
        grace_ms = grace.as_millis() as u64,
        "Processes survived SIGTERM, sending SIGKILL"
    );
    signal_each(&survivors, Signal::SIGKILL);
    match send(target, group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => SignalOutcome::Killed,
        Err(e) => {
            warn!(pid, error = %e, "Failed to send SIGKILL");
            SignalOutcome::Killed
        }
    }
}

fn send(target: Pid, group: bool, signal: Signal) -> nix::Result<()> {
    if group {
        killpg(target, signal)
    } else {
        kill(target, signal)
    }
}

fn signal_each(pids: &[Pid], signal: Signal) {
    for pid in pids {
        match kill(*pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = pid.as_raw(), ?signal, error = %e, "Failed to signal descendant"),
        }
    }
}

/// Zombies count as gone: they only wait to be reaped.
fn is_alive(target: Pid) -> bool {
    if matches!(kill(target, None), Err(Errno::ESRCH)) {
        return false;
    }
    !matches!(read_stat(target), Some((state, _)) if state == 'Z')
}

/// State letter and parent pid from `/proc/<pid>/stat`.
fn read_stat(pid: Pid) -> Option<(char, i32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&stat)
}

fn parse_stat(stat: &str) -> Option<(char, i32)> {
    // The command name is parenthesized and may itself contain ") "
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Every live process below `root`, parents before children.
fn descendants(root: Pid) -> Vec<Pid> {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, "Cannot list processes; only the recorded pid is signalled");
            return Vec::new();
        }
    };
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };
        if let Some((_, ppid)) = read_stat(Pid::from_raw(pid)) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root.as_raw()]);
    while let Some(parent) = queue.pop_front() {
        for child in children.remove(&parent).unwrap_or_default() {
            found.push(Pid::from_raw(child));
            queue.push_back(child);
        }
    }
    found
}
