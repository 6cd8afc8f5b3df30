// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-file storage classification of a run's working repositories.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use lfst_local_db::{Database, RunStore, TestRunRecord};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::git::GitContext;
use crate::scenario::{repository_dirs, run_dir};
use crate::verify::{measure_storage, LfsPointer, StorageReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Lfs,
    Git,
    Untracked,
    Ignored,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Lfs => "lfs",
            StorageClass::Git => "git",
            StorageClass::Untracked => "untracked",
            StorageClass::Ignored => "ignored",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDetail {
    pub path: String,
    pub size_bytes: u64,
    pub storage: StorageClass,
    /// Set when the working-tree file is still an unsmudged pointer
    pub pointer: Option<LfsPointer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDetail {
    pub label: &'static str,
    pub path: PathBuf,
    /// `None` when the directory is gone, e.g. after cleanup
    pub files: Option<Vec<FileDetail>>,
    pub storage: Option<StorageReport>,
}

impl RepositoryDetail {
    pub fn count(&self, class: StorageClass) -> usize {
        self.files
            .iter()
            .flatten()
            .filter(|f| f.storage == class)
            .count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().flatten().map(|f| f.size_bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDetail {
    pub run: TestRunRecord,
    pub repositories: Vec<RepositoryDetail>,
}

/// Classify a repository-relative path.
///
/// LFS listing wins; otherwise git status decides, with directory entries
/// (trailing `/`) covering everything below them.
pub fn classify(
    path: &str,
    lfs: &BTreeSet<String>,
    untracked: &BTreeSet<String>,
    ignored: &BTreeSet<String>,
) -> StorageClass {
    let covered = |set: &BTreeSet<String>| {
        set.contains(path)
            || set
                .iter()
                .any(|entry| entry.ends_with('/') && path.starts_with(entry.as_str()))
    };
    if lfs.contains(path) {
        StorageClass::Lfs
    } else if covered(untracked) {
        StorageClass::Untracked
    } else if covered(ignored) {
        StorageClass::Ignored
    } else {
        StorageClass::Git
    }
}

/// Inspect both repositories of `run_id`.
///
/// Runs created before work directories were recorded fall back to
/// `<work_root>/run-<id>`.
pub async fn inspect_run(
    db: &Database,
    run_id: i64,
    work_root: &Path,
    git: &GitContext,
) -> Result<RunDetail> {
    let run = {
        let conn = db.lock()?;
        RunStore::new(&conn).require(run_id)?
    };
    let dir = match run.work_dir.as_deref().filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => run_dir(work_root, run_id),
    };

    let mut repositories = Vec::new();
    for (label, path) in repository_dirs(&dir) {
        repositories.push(inspect_repository(label, path, git).await?);
    }
    Ok(RunDetail { run, repositories })
}

async fn inspect_repository(
    label: &'static str,
    path: PathBuf,
    git: &GitContext,
) -> Result<RepositoryDetail> {
    if !path.is_dir() {
        return Ok(RepositoryDetail {
            label,
            path,
            files: None,
            storage: None,
        });
    }

    let lfs: BTreeSet<String> = match git.lfs_ls_files(&path).await {
        Ok(files) => files.into_iter().collect(),
        Err(e) => {
            debug!(repo = %path.display(), error = %e, "Could not list LFS files");
            BTreeSet::new()
        }
    };
    let mut untracked = BTreeSet::new();
    let mut ignored = BTreeSet::new();
    match git.status_porcelain(&path).await {
        Ok(entries) => {
            for (status, file) in entries {
                if status.starts_with('?') {
                    untracked.insert(file);
                } else if status.starts_with('!') {
                    ignored.insert(file);
                }
            }
        }
        Err(e) => debug!(repo = %path.display(), error = %e, "Could not read git status"),
    }

    let root = path.clone();
    let files = tokio::task::spawn_blocking(move || list_files(&root, &lfs, &untracked, &ignored))
        .await??;
    let storage = measure_storage(&path)?;
    Ok(RepositoryDetail {
        label,
        path,
        files: Some(files),
        storage: Some(storage),
    })
}

fn list_files(
    root: &Path,
    lfs: &BTreeSet<String>,
    untracked: &BTreeSet<String>,
    ignored: &BTreeSet<String>,
) -> Result<Vec<FileDetail>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = relative_path(root, entry.path())?;
        let size_bytes = entry.metadata().map_err(|e| Error::Io(e.into()))?.len();
        files.push(FileDetail {
            storage: classify(&path, lfs, untracked, ignored),
            pointer: LfsPointer::read(entry.path()),
            path,
            size_bytes,
        });
    }
    Ok(files)
}

/// `path` below `root`, with `/` separators.
fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{} is not inside {}", path.display(), root.display()),
        ))
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
