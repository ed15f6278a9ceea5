// src/job/batch/runner.rs

//! Execution of scheduler command-line tools (`sbatch`, `squeue`, ...).
//!
//! The batch backend never spawns processes directly; it goes through a
//! [`CommandRunner`] so tests can script the scheduler's responses.

use std::fs::File;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    /// File fed to the command's stdin (LSF reads job scripts this way).
    pub stdin_file: Option<PathBuf>,
}

impl CommandRequest {
    pub fn new(program: &str, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.to_string(),
            args: args.into_iter().collect(),
            stdin_file: None,
        }
    }

    pub fn with_stdin(mut self, path: PathBuf) -> Self {
        self.stdin_file = Some(path);
        self
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = io::Result<CommandOutput>> + Send + 'a>>;

/// Runs external commands on behalf of a batch backend.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> CommandFuture<'a>;
}

/// Production runner: spawns the command and waits for it, bounded by
/// `[config].command_timeout`. A command still running at the deadline is
/// killed and reported as [`io::ErrorKind::TimedOut`].
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run<'a>(&'a self, request: &'a CommandRequest) -> CommandFuture<'a> {
        Box::pin(async move {
            let mut cmd = Command::new(&request.program);
            cmd.args(&request.args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match request.stdin_file {
                Some(ref path) => {
                    cmd.stdin(Stdio::from(File::open(path)?));
                }
                None => {
                    cmd.stdin(Stdio::null());
                }
            }

            trace!(program = %request.program, args = ?request.args, "running scheduler command");

            let output = tokio::time::timeout(self.timeout, cmd.output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("'{}' did not finish within {:?}", request.program, self.timeout),
                    )
                })??;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hung_command_is_killed_at_the_timeout() {
        let runner = SystemCommandRunner::new(Duration::from_millis(50));
        let request = CommandRequest::new("sleep", ["5".to_string()]);

        let started = std::time::Instant::now();
        let err = runner.run(&request).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let runner = SystemCommandRunner::new(Duration::from_secs(5));
        let request = CommandRequest::new("sh", ["-c".to_string(), "echo 42; exit 3".to_string()]);

        let out = runner.run(&request).await.unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "42");
        assert!(!out.success());
    }
}
