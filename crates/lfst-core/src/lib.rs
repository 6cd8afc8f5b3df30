// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scenario orchestration for Git LFS server evaluation.
//!
//! A [`ScenarioRunner`] drives real `git` and `git-lfs` binaries through a
//! fixed seven-step workflow, fingerprinting the working tree after each
//! step and checking that clones and pulls reproduce committed content
//! exactly. Snapshots go to a [`ChecksumSink`], which is either the local
//! store or, through ssh, the store on another machine.

pub mod cancel;
pub mod command;
pub mod detail;
pub mod dispatch;
pub mod error;
pub mod git;
pub mod scenario;
pub mod verify;

pub use cancel::{
    cancelled_count, lead_process_group, CancelOutcome, CancelTarget, Canceller, SignalOutcome,
};
pub use command::{CommandOutput, CommandSpec, Outcome};
pub use detail::{inspect_run, RunDetail, StorageClass};
pub use dispatch::{
    check_remote_host, current_hostname, import_export, ChecksumSink, Destination, LocalSink,
    RemoteSink,
};
pub use error::{Error, ErrorKind, Result};
pub use git::GitContext;
pub use scenario::{Phase, RunOptions, Scenario, ScenarioRunner, Workload};
pub use verify::{IntegrityError, LfsListing, LfsPointer, StorageReport, Verifier};
