use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, WlmError};
use crate::resources::ResourceVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether a job may move from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Pending)
                | (Scheduled, Failed)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = WlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "scheduled" => Ok(JobState::Scheduled),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" | "canceled" => Ok(JobState::Cancelled),
            other => Err(WlmError::InvalidJob(format!("unknown job state '{other}'"))),
        }
    }
}

/// What a client asks for when submitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub resources: ResourceVector,
    #[serde(default)]
    pub priority: u32,
    /// `None` or zero selects the controller default.
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>, resources: ResourceVector) -> Self {
        Self {
            name: String::new(),
            command: command.into(),
            resources,
            priority: 0,
            time_limit_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(WlmError::InvalidJob("command cannot be empty".to_string()));
        }
        if self.resources.cpus == 0 {
            return Err(WlmError::InvalidJob(
                "a job must request at least one cpu".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub command: String,
    pub resources: ResourceVector,
    pub time_limit_secs: u64,
    pub priority: u32,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub assigned_node: Option<String>,
    pub allocation_id: Option<Uuid>,
    pub launch_attempts: u32,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(owner: impl Into<String>, spec: JobSpec, default_time_limit_secs: u64) -> Self {
        Self::with_id(Uuid::new_v4(), owner, spec, default_time_limit_secs, Utc::now())
    }

    pub fn with_id(
        id: Uuid,
        owner: impl Into<String>,
        spec: JobSpec,
        default_time_limit_secs: u64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        let time_limit_secs = spec
            .time_limit_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(default_time_limit_secs);
        Self {
            id,
            name: spec.name,
            owner: owner.into(),
            command: spec.command,
            resources: spec.resources,
            time_limit_secs,
            priority: spec.priority,
            state: JobState::Pending,
            submitted_at,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            assigned_node: None,
            allocation_id: None,
            launch_attempts: 0,
            exit_code: None,
            reason: None,
            cancel_requested: false,
        }
    }

    /// Move to `next`, leaving the job untouched if the move is not allowed.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WlmError::InvalidTransition {
                job_id: self.id,
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(job_id = %self.id, from = %self.state, to = %next, "Job state transition");
        self.state = next;
        Ok(())
    }

    /// Seconds between start and end, zero if the job never started.
    pub fn elapsed_secs(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec::new("echo hi", ResourceVector::new(1, 128, 0))
    }

    #[test]
    fn new_job_is_pending_with_default_limit() {
        let job = Job::new("alice", spec(), 600);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.owner, "alice");
        assert_eq!(job.time_limit_secs, 600);
        assert!(job.assigned_node.is_none());

        let job = Job::new("alice", spec().with_time_limit(30), 600);
        assert_eq!(job.time_limit_secs, 30);
        let job = Job::new("alice", spec().with_time_limit(0), 600);
        assert_eq!(job.time_limit_secs, 600);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut job = Job::new("alice", spec(), 60);
        job.transition(JobState::Scheduled).unwrap();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Completed).unwrap();

        let err = job.transition(JobState::Running).unwrap_err();
        assert!(matches!(
            err,
            WlmError::InvalidTransition {
                from: JobState::Completed,
                to: JobState::Running,
                ..
            }
        ));
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn pending_cannot_jump_to_running() {
        let mut job = Job::new("alice", spec(), 60);
        assert!(job.transition(JobState::Running).is_err());
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
    }

    #[test]
    fn spec_validation() {
        assert!(spec().validate().is_ok());
        assert!(JobSpec::new("  ", ResourceVector::new(1, 0, 0))
            .validate()
            .is_err());
        assert!(JobSpec::new("true", ResourceVector::ZERO).validate().is_err());
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<JobState>().unwrap(), JobState::Running);
        assert_eq!("canceled".parse::<JobState>().unwrap(), JobState::Cancelled);
        assert!("lost".parse::<JobState>().is_err());
    }
}
