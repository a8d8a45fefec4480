//! External process execution
//!
//! The applier never spawns processes itself; it goes through a
//! [`ProcessRunner`] so tests can substitute a simulated system.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn status_string(&self) -> String {
        match self.status {
            Some(code) => format!("exit code {}", code),
            None => "signal".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("{0}")]
    Spawn(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Runs a command line to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, RunError>;
}

/// Runs commands on the host, killing any that exceed the deadline
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, RunError> {
        let (program, args) = argv.split_first().ok_or(RunError::EmptyCommand)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        // Dropping the output future kills the child
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| RunError::TimedOut(self.timeout))??;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
