use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::scheduler::Job;
use crate::worker::Executor;

/// Outcome of one shell invocation.
#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Runs the job's config payload as a `sh -c` command.
///
/// The child is killed as soon as the cancellation token fires.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub const NAME: &'static str = "shell";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Run `command`, returning its captured output.
    pub async fn run(&self, cancel: &CancellationToken, command: &str) -> Result<ShellOutput> {
        if command.trim().is_empty() {
            return Err(SchedulerError::ExecutionFailed("empty command".to_string()));
        }

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SchedulerError::ExecutionFailed(e.to_string()))?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
            output = child.wait_with_output() => {
                output.map_err(|e| SchedulerError::ExecutionFailed(e.to_string()))?
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok(ShellOutput {
            exit_code: output.status.code(),
            stdout: (!stdout.is_empty()).then_some(stdout),
            stderr: (!stderr.is_empty()).then_some(stderr),
        })
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn exec(&self, cancel: &CancellationToken, job: &Job) -> Result<()> {
        tracing::info!(job_id = job.id, command = %job.config, "Executing shell job");
        let output = self.run(cancel, &job.config).await?;

        if output.exit_code == Some(0) {
            tracing::debug!(job_id = job.id, stdout = ?output.stdout, "Shell job completed");
            return Ok(());
        }

        Err(SchedulerError::ExecutionFailed(match output.stderr {
            Some(stderr) => stderr.trim_end().to_string(),
            None => format!("exit code: {:?}", output.exit_code),
        }))
    }
}
