// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! External command execution with uniform outcome reporting.
//!
//! Every git, git-lfs, gh and ssh invocation goes through [`run`]. The
//! caller always gets a [`CommandOutput`] back; the four ways a command can
//! end are distinguished by [`Outcome`] rather than by an error path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A command to run: program, arguments, working directory and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            timeout: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Exited non-zero; `None` when terminated by a signal
    NonZeroExit { code: Option<i32> },
    SpawnFailed {
        kind: std::io::ErrorKind,
        message: String,
    },
    TimedOut { after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Rendered command line, for messages and operation records
    pub command: String,
    pub program: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub outcome: Outcome,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// One-line failure description, `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::NonZeroExit { code } => Some(format!(
                "{}: {}",
                exit_status_text(*code),
                self.stderr.trim()
            )),
            Outcome::SpawnFailed { message, .. } => Some(format!("failed to start: {}", message)),
            Outcome::TimedOut { after } => Some(format!("timed out after {:?}", after)),
        }
    }

    /// Convert a failed outcome into the matching [`Error`].
    pub fn into_result(self) -> Result<CommandOutput> {
        match &self.outcome {
            Outcome::Success => Ok(self),
            Outcome::NonZeroExit { code } => Err(Error::CommandFailed {
                command: self.command.clone(),
                status: exit_status_text(*code),
                stderr: self.stderr.trim().to_string(),
            }),
            Outcome::SpawnFailed { kind, message } => Err(Error::Spawn {
                program: self.program.clone(),
                kind: *kind,
                message: message.clone(),
            }),
            Outcome::TimedOut { after } => Err(Error::Timeout {
                command: self.command.clone(),
                after: *after,
            }),
        }
    }
}

fn exit_status_text(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Run a command to completion, capturing both output streams.
///
/// A timed-out child is killed before this returns.
pub async fn run(spec: &CommandSpec) -> CommandOutput {
    let command = spec.to_string();
    let started = Instant::now();
    debug!(command = %command, dir = ?spec.dir, "Running command");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.dir {
        cmd.current_dir(dir);
    }

    let finish = |exit_code, stdout: String, stderr: String, outcome| CommandOutput {
        command: command.clone(),
        program: spec.program.clone(),
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as i64,
        outcome,
    };

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %command, error = %e, "Failed to spawn command");
            return finish(
                None,
                String::new(),
                String::new(),
                Outcome::SpawnFailed {
                    kind: e.kind(),
                    message: e.to_string(),
                },
            );
        }
    };

    if let (Some(data), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&data).await {
                debug!(error = %e, "Child closed stdin early");
            }
            // Dropping the handle closes the pipe
        });
    }

    let waited = child.wait_with_output();
    let result = match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, waited).await {
            Ok(result) => result,
            Err(_) => {
                // The future owning the child was dropped, which kills it
                warn!(command = %command, timeout = ?limit, "Command timed out");
                return finish(
                    None,
                    String::new(),
                    String::new(),
                    Outcome::TimedOut { after: limit },
                );
            }
        },
        None => waited.await,
    };

    match result {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let outcome = if output.status.success() {
                Outcome::Success
            } else {
                Outcome::NonZeroExit {
                    code: output.status.code(),
                }
            };
            debug!(
                command = %command,
                exit_code = ?output.status.code(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Command finished"
            );
            finish(output.status.code(), stdout, stderr, outcome)
        }
        Err(e) => finish(
            None,
            String::new(),
            String::new(),
            Outcome::SpawnFailed {
                kind: e.kind(),
                message: e.to_string(),
            },
        ),
    }
}

/// Run and convert any failure into an error.
pub async fn run_checked(spec: &CommandSpec) -> Result<CommandOutput> {
    run(spec).await.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let out = run(&CommandSpec::new("sh").args(["-c", "echo hello"])).await;
        assert!(out.success());
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.failure_message().is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr() {
        let out = run(&CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"])).await;
        assert_eq!(out.outcome, Outcome::NonZeroExit { code: Some(3) });
        assert_eq!(out.failure_message().unwrap(), "exit code 3: boom");
        match out.into_result() {
            Err(Error::CommandFailed { status, stderr, .. }) => {
                assert_eq!(status, "exit code 3");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_failure() {
        let out = run(&CommandSpec::new("lfst-definitely-not-a-real-program")).await;
        match &out.outcome {
            Outcome::SpawnFailed { kind, .. } => assert_eq!(*kind, std::io::ErrorKind::NotFound),
            other => panic!("unexpected outcome: {:?}", other),
        }
        let err = out.into_result().unwrap_err();
        assert!(err.remediation().unwrap().contains("lfst-definitely-not-a-real-program"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let started = Instant::now();
        let out = run(&CommandSpec::new("sleep")
            .arg("30")
            .timeout(Some(Duration::from_millis(200))))
        .await;
        assert_eq!(
            out.outcome,
            Outcome::TimedOut {
                after: Duration::from_millis(200)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(out.into_result(), Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let out = run(&CommandSpec::new("cat").stdin("piped data")).await;
        assert!(out.success());
        assert_eq!(out.stdout, "piped data");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let out = run(&CommandSpec::new("ls").current_dir(dir.path())).await;
        assert!(out.stdout.contains("marker"));
    }

    #[test]
    fn test_display() {
        let spec = CommandSpec::new("git").args(["lfs", "track", "*.pdf"]);
        assert_eq!(spec.to_string(), "git lfs track *.pdf");
    }
}
