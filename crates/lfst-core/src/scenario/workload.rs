// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// File committed by the second client in phase 5.
pub const SECOND_CLIENT_FILE: &str = "README.md";
pub const SECOND_CLIENT_CONTENT: &str =
    "# LFS Test Repository\n\nThis file was added during Step 5 testing.\n";

const INITIAL_DIR: &str = "v1";
const UPDATES_DIR: &str = "v2";

/// A test-data file and the name it gets inside the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadFile {
    pub name: String,
    pub source: PathBuf,
}

/// The file set a run commits and the fixed transform applied in phase 3.
///
/// Initial files are read from `<test data>/v1`, updates from
/// `<test data>/v2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub patterns: Vec<String>,
    pub initial: Vec<String>,
    pub updates: Vec<String>,
    pub deletions: Vec<String>,
    pub renames: Vec<(String, String)>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            patterns: owned(&["*.pdf", "*.mov", "*.avi", "*.ogg", "*.m4v", "*.zip"]),
            initial: owned(&[
                "pdf1.pdf",
                "video1.m4v",
                "video2.mov",
                "video3.avi",
                "video4.ogg",
                "zip1.zip",
                "zip2.zip",
            ]),
            updates: owned(&["pdf1.pdf", "video2.mov", "video3.avi", "zip1.zip"]),
            deletions: owned(&["video1.m4v", "video4.ogg"]),
            renames: vec![("zip2.zip".to_string(), "zip2_renamed.zip".to_string())],
        }
    }
}

impl Workload {
    pub fn initial_files(&self, test_data: &Path) -> Vec<WorkloadFile> {
        files_in(&test_data.join(INITIAL_DIR), &self.initial)
    }

    pub fn update_files(&self, test_data: &Path) -> Vec<WorkloadFile> {
        files_in(&test_data.join(UPDATES_DIR), &self.updates)
    }

    /// Paths LFS must track after the initial commit.
    pub fn tracked_after_commit(&self) -> Vec<String> {
        let mut names = self.initial.clone();
        names.sort();
        names
    }

    /// Paths LFS must track once the phase 3 transform is committed.
    pub fn tracked_after_transform(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.initial.iter().cloned().collect();
        for deleted in &self.deletions {
            names.remove(deleted);
        }
        for (from, to) in &self.renames {
            if names.remove(from) {
                names.insert(to.clone());
            }
        }
        names.into_iter().collect()
    }

    /// Confirm every source file exists before a run is created.
    pub fn validate(&self, test_data: &Path) -> Result<()> {
        if !test_data.is_dir() {
            return Err(Error::environment(
                format!("test data directory not found at {}", test_data.display()),
                "Set LFS_TEST_DATA or test-data in the config file",
            ));
        }
        let missing: Vec<String> = self
            .initial_files(test_data)
            .into_iter()
            .chain(self.update_files(test_data))
            .filter(|f| !f.source.is_file())
            .map(|f| f.source.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::environment(
                format!(
                    "test data directory found at {} but files are missing: {}",
                    test_data.display(),
                    missing.join(", ")
                ),
                "Place the test files in the v1/ and v2/ subdirectories",
            ));
        }
        Ok(())
    }

    pub async fn materialize_initial(&self, test_data: &Path, repo: &Path) -> Result<u64> {
        copy_files(&self.initial_files(test_data), repo).await
    }

    /// Apply updates, then deletions, then renames.
    pub async fn apply_transform(&self, test_data: &Path, repo: &Path) -> Result<()> {
        copy_files(&self.update_files(test_data), repo).await?;
        for name in &self.deletions {
            tokio::fs::remove_file(repo.join(name)).await?;
            debug!(file = %name, "Deleted");
        }
        for (from, to) in &self.renames {
            tokio::fs::rename(repo.join(from), repo.join(to)).await?;
            debug!(from = %from, to = %to, "Renamed");
        }
        Ok(())
    }
}

fn files_in(dir: &Path, names: &[String]) -> Vec<WorkloadFile> {
    names
        .iter()
        .map(|name| WorkloadFile {
            name: name.clone(),
            source: dir.join(name),
        })
        .collect()
}

async fn copy_files(files: &[WorkloadFile], repo: &Path) -> Result<u64> {
    let mut total = 0;
    for file in files {
        let dest = repo.join(&file.name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        total += tokio::fs::copy(&file.source, &dest).await?;
        debug!(file = %file.name, "Copied test file");
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfst_test_utils::write_tree;

    fn small() -> Workload {
        Workload {
            patterns: owned(&["*.bin"]),
            initial: owned(&["a.bin", "b.bin", "c.bin"]),
            updates: owned(&["a.bin"]),
            deletions: owned(&["b.bin"]),
            renames: vec![("c.bin".into(), "d.bin".into())],
        }
    }

    #[test]
    fn test_standard_transform_tracking() {
        let w = Workload::default();
        assert_eq!(w.tracked_after_commit().len(), 7);
        assert_eq!(
            w.tracked_after_transform(),
            owned(&["pdf1.pdf", "video2.mov", "video3.avi", "zip1.zip", "zip2_renamed.zip"])
        );
    }

    #[test]
    fn test_validate_reports_missing_files() {
        let data = tempfile::tempdir().unwrap();
        write_tree(data.path(), &[("v1/a.bin", "1"), ("v1/b.bin", "2")]).unwrap();
        let err = small().validate(data.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("c.bin"), "{}", msg);
        assert!(msg.contains("v2"), "{}", msg);
        assert_eq!(err.kind(), crate::ErrorKind::Environment);

        assert!(small().validate(&data.path().join("absent")).is_err());
    }

    #[tokio::test]
    async fn test_materialize_and_transform() {
        let data = tempfile::tempdir().unwrap();
        write_tree(
            data.path(),
            &[
                ("v1/a.bin", "one"),
                ("v1/b.bin", "two"),
                ("v1/c.bin", "three"),
                ("v2/a.bin", "one, revised"),
            ],
        )
        .unwrap();
        let repo = tempfile::tempdir().unwrap();
        let w = small();
        w.validate(data.path()).unwrap();

        let copied = w.materialize_initial(data.path(), repo.path()).await.unwrap();
        assert_eq!(copied, 11);

        w.apply_transform(data.path(), repo.path()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(repo.path().join("a.bin")).unwrap(),
            "one, revised"
        );
        assert!(!repo.path().join("b.bin").exists());
        assert!(!repo.path().join("c.bin").exists());
        assert_eq!(std::fs::read_to_string(repo.path().join("d.bin")).unwrap(), "three");
        assert_eq!(w.tracked_after_transform(), owned(&["a.bin", "d.bin"]));
    }
}
