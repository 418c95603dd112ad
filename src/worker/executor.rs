use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::scheduler::JobState;

/// Result of job execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Runs job commands as `sh -c <command>` child processes.
///
/// The child is killed when its wall-time limit passes or when the job is
/// terminated; either way the process never outlives the returned future.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor;

impl JobExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute(
        &self,
        job_id: Uuid,
        command: &str,
        time_limit: Duration,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        tracing::info!(job_id = %job_id, command, limit_secs = time_limit.as_secs(), "Executing job");
        let started_at = Utc::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to spawn job");
                return ExecutionResult {
                    job_id,
                    state: JobState::Failed,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                    started_at,
                    ended_at: Utc::now(),
                };
            }
        };

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            result = child.wait_with_output() => {
                Self::process_output(job_id, started_at, result)
            }
            _ = tokio::time::sleep(time_limit) => {
                tracing::warn!(job_id = %job_id, limit_secs = time_limit.as_secs(), "Job exceeded its time limit");
                ExecutionResult {
                    job_id,
                    state: JobState::Failed,
                    exit_code: None,
                    output: None,
                    error: Some(format!("time limit of {}s exceeded", time_limit.as_secs())),
                    started_at,
                    ended_at: Utc::now(),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job_id, "Job terminated");
                ExecutionResult {
                    job_id,
                    state: JobState::Cancelled,
                    exit_code: None,
                    output: None,
                    error: None,
                    started_at,
                    ended_at: Utc::now(),
                }
            }
        }
    }

    fn process_output(
        job_id: Uuid,
        started_at: DateTime<Utc>,
        result: Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        let ended_at = Utc::now();
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (state, error) = if output.status.success() {
                    (JobState::Completed, None)
                } else {
                    (
                        JobState::Failed,
                        Some(if stderr.is_empty() {
                            format!("Exit code: {:?}", exit_code)
                        } else {
                            stderr.trim_end().to_string()
                        }),
                    )
                };

                tracing::info!(
                    job_id = %job_id,
                    state = %state,
                    exit_code = ?exit_code,
                    "Job finished"
                );

                ExecutionResult {
                    job_id,
                    state,
                    exit_code,
                    output: (!stdout.is_empty()).then_some(stdout),
                    error,
                    started_at,
                    ended_at,
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job execution failed");
                ExecutionResult {
                    job_id,
                    state: JobState::Failed,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                    started_at,
                    ended_at,
                }
            }
        }
    }
}
