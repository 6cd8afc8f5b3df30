// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::FileChecksum;

/// A snapshot as exchanged between `lfst checksum --remote` and
/// `lfst import` on the store host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumExport {
    pub run_id: i64,
    pub step_number: u32,
    pub checksums: Vec<FileChecksum>,
    pub computed_at: DateTime<Utc>,
}

impl ChecksumExport {
    pub fn new(run_id: i64, step_number: u32, checksums: Vec<FileChecksum>) -> Self {
        Self {
            run_id,
            step_number,
            checksums,
            computed_at: Utc::now(),
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
