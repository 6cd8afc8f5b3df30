// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test helpers for the `lfst` crates.
//!
//! - [`TestLogger`] gives every test its own log file under
//!   `target/test-logs/`, printing only a one-line verdict to stdout.
//! - [`fixtures`] builds file trees and isolates git configuration so tests
//!   that drive real `git`/`git-lfs` binaries never touch the user's setup.

pub mod fixtures;
pub mod logging;

pub use fixtures::{git_available, git_lfs_available, write_tree, IsolatedGitConfig, StubGitLfs};
pub use logging::{create_unique_test_log, TestLogError, TestLogger};
