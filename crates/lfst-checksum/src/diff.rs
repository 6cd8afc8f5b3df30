// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::FileChecksum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Added,
    Deleted,
    /// Same size, different content
    Modified,
    SizeChanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Modified => "modified",
            ChangeKind::SizeChanged => "size-changed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One path that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    pub path: String,
    pub kind: ChangeKind,
    pub old: Option<FileChecksum>,
    pub new: Option<FileChecksum>,
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => write!(
                f,
                "{} {} ({} {} -> {} {})",
                self.kind,
                self.path,
                old.crc32_hex(),
                old.size_bytes,
                new.crc32_hex(),
                new.size_bytes
            ),
            _ => write!(f, "{} {}", self.kind, self.path),
        }
    }
}

/// Compare two snapshots and return every differing path, sorted by path.
///
/// Duplicate paths within one snapshot collapse to the last entry.
pub fn diff(old: &[FileChecksum], new: &[FileChecksum]) -> Vec<Difference> {
    let old_by_path: BTreeMap<&str, &FileChecksum> =
        old.iter().map(|c| (c.path.as_str(), c)).collect();
    let new_by_path: BTreeMap<&str, &FileChecksum> =
        new.iter().map(|c| (c.path.as_str(), c)).collect();

    let mut differences = Vec::new();

    for (path, old_cs) in &old_by_path {
        match new_by_path.get(path) {
            None => differences.push(Difference {
                path: path.to_string(),
                kind: ChangeKind::Deleted,
                old: Some((*old_cs).clone()),
                new: None,
            }),
            Some(new_cs) if new_cs.crc32 != old_cs.crc32 => {
                let kind = if new_cs.size_bytes == old_cs.size_bytes {
                    ChangeKind::Modified
                } else {
                    ChangeKind::SizeChanged
                };
                differences.push(Difference {
                    path: path.to_string(),
                    kind,
                    old: Some((*old_cs).clone()),
                    new: Some((*new_cs).clone()),
                });
            }
            Some(_) => {}
        }
    }

    for (path, new_cs) in &new_by_path {
        if !old_by_path.contains_key(path) {
            differences.push(Difference {
                path: path.to_string(),
                kind: ChangeKind::Added,
                old: None,
                new: Some((*new_cs).clone()),
            });
        }
    }

    differences.sort_by(|a, b| a.path.cmp(&b.path));
    differences
}
