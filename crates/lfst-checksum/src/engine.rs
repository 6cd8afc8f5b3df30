// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ChecksumError, Result};
use crate::FileChecksum;

/// Sidecar file some tools drop next to the data; never fingerprinted.
pub const CHECKSUM_SIDECAR: &str = ".checksums";

const GIT_DIR: &str = ".git";
const READ_BUFFER: usize = 64 * 1024;

/// Stream `path` through CRC32 and return `(crc32, bytes read)`.
pub fn compute_file(path: &Path) -> Result<(u32, u64)> {
    let io_err = |source| ChecksumError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((hasher.finalize(), size))
}

/// Fingerprint every regular file below `root`.
///
/// `.git` entries and the checksum sidecar are skipped, symlinks are not
/// followed. The result is sorted by relative path. Any walk or read error
/// aborts the whole snapshot.
pub fn compute_directory(root: &Path) -> Result<Vec<FileChecksum>> {
    let mut checksums = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != GIT_DIR);

    for entry in walker {
        let entry = entry.map_err(|source| ChecksumError::Walk {
            root: root.to_path_buf(),
            source,
        })?;

        if !entry.file_type().is_file() || entry.file_name() == CHECKSUM_SIDECAR {
            continue;
        }

        let (crc32, size_bytes) = compute_file(entry.path())?;
        let rel = relative_posix_path(root, entry.path())?;
        checksums.push(FileChecksum {
            path: rel,
            crc32,
            size_bytes,
        });
    }

    checksums.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), files = checksums.len(), "Computed directory checksums");
    Ok(checksums)
}

fn relative_posix_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut parts = Vec::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            let part = part
                .to_str()
                .ok_or_else(|| ChecksumError::NonUtf8Path(path.to_path_buf()))?;
            parts.push(part);
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_compute_file_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "check.txt", b"123456789");

        let (crc, size) = compute_file(&dir.path().join("check.txt")).unwrap();
        assert_eq!(crc, 0xcbf43926);
        assert_eq!(size, 9);
    }

    #[test]
    fn test_compute_file_empty() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "empty", b"");

        assert_eq!(compute_file(&dir.path().join("empty")).unwrap(), (0, 0));
    }

    #[test]
    fn test_compute_file_larger_than_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..(READ_BUFFER * 3 + 17)).map(|i| (i % 251) as u8).collect();
        write(dir.path(), "big.bin", &content);

        let (crc, size) = compute_file(&dir.path().join("big.bin")).unwrap();
        assert_eq!(crc, crc32fast::hash(&content));
        assert_eq!(size, content.len() as u64);
    }

    #[test]
    fn test_compute_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_file(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, ChecksumError::Io { .. }));
    }

    #[test]
    fn test_directory_sorted_and_nested() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "z.txt", b"z");
        write(dir.path(), "a/b/c/deep.bin", b"deep");
        write(dir.path(), "m.pdf", b"pdf");

        let checksums = compute_directory(dir.path()).unwrap();
        let paths: Vec<_> = checksums.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a/b/c/deep.bin", "m.pdf", "z.txt"]);
        assert_eq!(checksums[0].size_bytes, 4);
    }

    #[test]
    fn test_directory_skips_git_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "file.txt", b"content");
        write(dir.path(), ".git/config", b"[core]");
        write(dir.path(), ".git/lfs/objects/ab/cd/abcd", b"object");
        write(dir.path(), "sub/.git", b"gitdir: ../.git/modules/sub");
        write(dir.path(), CHECKSUM_SIDECAR, b"file.txt 1234");
        write(dir.path(), ".gitattributes", b"*.pdf filter=lfs");

        let checksums = compute_directory(dir.path()).unwrap();
        let paths: Vec<_> = checksums.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec![".gitattributes", "file.txt"]);
    }

    #[test]
    fn test_directory_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(compute_directory(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_directory_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            write(dir.path(), &format!("d{}/f{}.bin", i % 3, i), format!("{}", i).as_bytes());
        }

        let first = compute_directory(dir.path()).unwrap();
        let second = compute_directory(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn test_directory_missing_root_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_directory(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, ChecksumError::Walk { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "real.txt", b"real");
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let checksums = compute_directory(dir.path()).unwrap();
        assert_eq!(checksums.len(), 1);
        assert_eq!(checksums[0].path, "real.txt");
    }
}
