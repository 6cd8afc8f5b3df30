// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File fingerprints for LFS integrity checks.
//!
//! A fingerprint is the IEEE CRC32 (the `cksum` polynomial) and byte size of
//! one file. A snapshot is the path-sorted list of fingerprints for every
//! regular file below a working directory, and two snapshots are compared
//! with [`diff`].

pub mod diff;
pub mod engine;
pub mod error;
pub mod interchange;

/// Snapshot comparison
pub use diff::{diff, ChangeKind, Difference};
/// Directory and file fingerprinting
pub use engine::{compute_directory, compute_file, CHECKSUM_SIDECAR};
pub use error::{ChecksumError, Result};
/// JSON shape shipped to a remote store
pub use interchange::ChecksumExport;

use serde::{Deserialize, Serialize};

/// Fingerprint of a single file relative to the snapshot root.
///
/// The serialized field names are part of the remote import wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileChecksum {
    /// Relative, `/`-separated path
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "CRC32")]
    pub crc32: u32,
    #[serde(rename = "SizeBytes")]
    pub size_bytes: u64,
}

impl FileChecksum {
    pub fn new(path: impl Into<String>, crc32: u32, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            crc32,
            size_bytes,
        }
    }

    /// Fixed-width lowercase hex, the representation kept in the store.
    pub fn crc32_hex(&self) -> String {
        crc32_to_hex(self.crc32)
    }
}

pub fn crc32_to_hex(crc32: u32) -> String {
    format!("{:08x}", crc32)
}

pub fn crc32_from_hex(hex: &str) -> Result<u32> {
    u32::from_str_radix(hex.trim(), 16).map_err(|_| ChecksumError::InvalidHex(hex.to_string()))
}

/// Format a byte count with binary units, e.g. `1.5 KB`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_fixed_width() {
        assert_eq!(crc32_to_hex(0), "00000000");
        assert_eq!(crc32_to_hex(0xcbf43926), "cbf43926");
        assert_eq!(FileChecksum::new("a", 0xabc, 1).crc32_hex(), "00000abc");
    }

    #[test]
    fn test_hex_parse() {
        assert_eq!(crc32_from_hex("cbf43926").unwrap(), 0xcbf43926);
        assert_eq!(crc32_from_hex("00000abc").unwrap(), 0xabc);
        assert!(matches!(
            crc32_from_hex("not-hex"),
            Err(ChecksumError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(FileChecksum::new("dir/a.pdf", 7, 42)).unwrap();
        assert_eq!(json["Path"], "dir/a.pdf");
        assert_eq!(json["CRC32"], 7);
        assert_eq!(json["SizeBytes"], 42);
    }
}
