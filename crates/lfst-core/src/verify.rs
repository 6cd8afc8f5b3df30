// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! LFS integrity checks for a working directory.
//!
//! Tracking is established by asking git-lfs (`git lfs ls-files -n`), never
//! by inspecting working-tree files: checked-out copies are always smudged
//! and never look like pointers.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::git::GitContext;

/// Source of the LFS-tracked path list for a repository.
#[async_trait]
pub trait LfsListing: Send + Sync {
    async fn tracked_files(&self, repo: &Path) -> Result<Vec<String>>;
}

/// Lists tracked files with `git lfs ls-files -n`.
pub struct GitLfsListing {
    git: GitContext,
}

impl GitLfsListing {
    pub fn new(git: GitContext) -> Self {
        Self { git }
    }
}

#[async_trait]
impl LfsListing for GitLfsListing {
    async fn tracked_files(&self, repo: &Path) -> Result<Vec<String>> {
        self.git.lfs_ls_files(repo).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error(
        "expected {expected} files to be tracked by LFS, but {} are not: {}",
        .missing.len(),
        .missing.join(", ")
    )]
    NotTracked { expected: usize, missing: Vec<String> },

    #[error(
        "expected files to not be tracked by LFS, but {} still are: {}",
        .paths.len(),
        .paths.join(", ")
    )]
    StillTracked { paths: Vec<String> },

    #[error("expected at least {expected} LFS objects, found {found}")]
    TooFewObjects { expected: usize, found: usize },

    #[error(
        "git objects ({}) larger than LFS objects ({}); LFS is not externalizing content",
        size(.git_bytes),
        size(.lfs_bytes)
    )]
    MetadataDominates { git_bytes: u64, lfs_bytes: u64 },

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<IntegrityError>),
}

fn size(bytes: &u64) -> String {
    lfst_checksum::format_size(*bytes)
}

/// Object store measurements for one repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageReport {
    pub lfs_objects: usize,
    pub lfs_bytes: u64,
    pub git_objects: usize,
    pub git_bytes: u64,
}

impl fmt::Display for StorageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} LFS objects ({}), git objects {}",
            self.lfs_objects,
            lfst_checksum::format_size(self.lfs_bytes),
            lfst_checksum::format_size(self.git_bytes)
        )
    }
}

pub fn lfs_objects_dir(repo: &Path) -> PathBuf {
    repo.join(".git").join("lfs").join("objects")
}

pub fn git_objects_dir(repo: &Path) -> PathBuf {
    repo.join(".git").join("objects")
}

/// Count files and bytes below `dir`; a missing directory measures zero.
pub fn measure_dir(dir: &Path) -> Result<(usize, u64)> {
    if !dir.exists() {
        return Ok((0, 0));
    }
    let mut count = 0;
    let mut bytes = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if entry.file_type().is_file() {
            count += 1;
            bytes += entry.metadata().map_err(|e| Error::Io(e.into()))?.len();
        }
    }
    Ok((count, bytes))
}

pub fn measure_storage(repo: &Path) -> Result<StorageReport> {
    let (lfs_objects, lfs_bytes) = measure_dir(&lfs_objects_dir(repo))?;
    let (git_objects, git_bytes) = measure_dir(&git_objects_dir(repo))?;
    Ok(StorageReport {
        lfs_objects,
        lfs_bytes,
        git_objects,
        git_bytes,
    })
}

/// Runs the independent integrity checks against one repository.
#[derive(Clone)]
pub struct Verifier {
    listing: Arc<dyn LfsListing>,
}

impl Verifier {
    pub fn new(listing: Arc<dyn LfsListing>) -> Self {
        Self { listing }
    }

    /// Every path in `expected` must be reported by the LFS listing.
    pub async fn verify_tracked(&self, repo: &Path, expected: &[String]) -> Result<()> {
        let tracked: BTreeSet<String> = self.listing.tracked_files(repo).await?.into_iter().collect();
        Self::check_tracked(&tracked, expected)?;
        debug!(repo = %repo.display(), count = expected.len(), "All expected files are tracked by LFS");
        Ok(())
    }

    fn check_tracked(
        tracked: &BTreeSet<String>,
        expected: &[String],
    ) -> std::result::Result<(), IntegrityError> {
        let missing: Vec<String> = expected
            .iter()
            .filter(|p| !tracked.contains(*p))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IntegrityError::NotTracked {
                expected: expected.len(),
                missing,
            })
        }
    }

    pub fn verify_object_count(
        report: &StorageReport,
        minimum: usize,
    ) -> std::result::Result<(), IntegrityError> {
        if report.lfs_objects < minimum {
            return Err(IntegrityError::TooFewObjects {
                expected: minimum,
                found: report.lfs_objects,
            });
        }
        Ok(())
    }

    /// The LFS store must not be smaller than the git object store. An
    /// empty LFS store is left to the object count check.
    pub fn verify_storage_ratio(report: &StorageReport) -> std::result::Result<(), IntegrityError> {
        if report.lfs_bytes > 0 && report.git_bytes > report.lfs_bytes {
            return Err(IntegrityError::MetadataDominates {
                git_bytes: report.git_bytes,
                lfs_bytes: report.lfs_bytes,
            });
        }
        Ok(())
    }

    /// Run every check and report all failures together.
    ///
    /// Returns the storage measurements so callers can record them.
    pub async fn verify_all(&self, repo: &Path, expected: &[String]) -> Result<StorageReport> {
        let mut failures = Vec::new();

        match self.listing.tracked_files(repo).await {
            Ok(files) => {
                let tracked: BTreeSet<String> = files.into_iter().collect();
                if let Err(e) = Self::check_tracked(&tracked, expected) {
                    failures.push(e);
                }
            }
            Err(e) => return Err(e),
        }

        let report = measure_storage(repo)?;
        if let Err(e) = Self::verify_object_count(&report, expected.len()) {
            failures.push(e);
        }
        if let Err(e) = Self::verify_storage_ratio(&report) {
            failures.push(e);
        }

        match failures.len() {
            0 => {
                info!(repo = %repo.display(), %report, "LFS verification passed");
                Ok(report)
            }
            1 => Err(failures.remove(0).into()),
            _ => Err(IntegrityError::Multiple(failures).into()),
        }
    }

    /// None of `paths` may still be tracked by LFS.
    pub async fn verify_not_tracked(&self, repo: &Path, paths: &[String]) -> Result<()> {
        let tracked: BTreeSet<String> = self.listing.tracked_files(repo).await?.into_iter().collect();
        let still: Vec<String> = paths.iter().filter(|p| tracked.contains(*p)).cloned().collect();
        if !still.is_empty() {
            return Err(IntegrityError::StillTracked { paths: still }.into());
        }
        info!(repo = %repo.display(), "No files tracked by LFS");
        Ok(())
    }
}

const POINTER_VERSION_PREFIX: &str = "version https://git-lfs.github.com/spec/";
const POINTER_MAX_BYTES: u64 = 1024;

fn is_sha256_hex(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Parsed LFS pointer file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LfsPointer {
    pub version: String,
    pub oid: String,
    pub size: u64,
}

impl LfsPointer {
    /// Parse pointer text; `None` unless all three required lines are
    /// present and the oid is a lowercase hex SHA-256.
    pub fn parse(text: &str) -> Option<Self> {
        let mut version = None;
        let mut oid = None;
        let mut size = None;
        for line in text.lines().map(str::trim) {
            if line.starts_with(POINTER_VERSION_PREFIX) {
                version = line.strip_prefix("version ").map(str::to_string);
            } else if let Some(rest) = line.strip_prefix("oid sha256:") {
                oid = is_sha256_hex(rest).then(|| rest.to_string());
            } else if let Some(rest) = line.strip_prefix("size ") {
                size = rest.parse().ok();
            }
        }
        Some(Self {
            version: version?,
            oid: oid?,
            size: size?,
        })
    }

    /// Read `path` as a pointer; large or unreadable files are not pointers.
    pub fn read(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        if !meta.is_file() || meta.len() > POINTER_MAX_BYTES {
            return None;
        }
        let text = std::fs::read_to_string(path).ok()?;
        Self::parse(&text)
    }
}
