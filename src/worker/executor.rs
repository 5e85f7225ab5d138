use std::future::Future;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{QueueError, Result};

/// Outcome of running a job command to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn from_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: None,
            error: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short human-readable reason for a failed run.
    pub fn failure_reason(&self) -> String {
        match (&self.error, self.exit_code) {
            (Some(stderr), _) => stderr.trim().to_string(),
            (None, Some(code)) => format!("Exit code: {code}"),
            (None, None) => "Terminated by signal".to_string(),
        }
    }
}

/// Runs a job's command. An `Err` means the command could not be run at all;
/// workers treat it the same as a non-zero exit.
///
/// No timeout is applied by the worker. Runners that need bounded execution
/// must enforce it themselves and report failure.
pub trait CommandRunner: Send + Sync + 'static {
    fn execute(&self, command: &str) -> impl Future<Output = Result<ExecutionResult>> + Send;
}

/// Executes commands through `sh -c`, capturing stdout and stderr.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn process_output(output: std::process::Output) -> ExecutionResult {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        ExecutionResult {
            exit_code: output.status.code(),
            output: (!stdout.is_empty()).then_some(stdout),
            error: (!output.status.success() && !stderr.is_empty()).then_some(stderr),
        }
    }
}

impl CommandRunner for ShellRunner {
    async fn execute(&self, command: &str) -> Result<ExecutionResult> {
        tracing::debug!(shell = %self.shell, command, "Spawning job command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                QueueError::ExecutionFailure(format!("failed to spawn {}: {e}", self.shell))
            })?;

        let result = Self::process_output(output);
        tracing::debug!(
            command,
            exit_code = ?result.exit_code,
            stdout = result.output.as_deref().unwrap_or_default(),
            stderr = result.error.as_deref().unwrap_or_default(),
            "Job command finished"
        );
        Ok(result)
    }
}
