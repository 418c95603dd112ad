use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, WlmError};
use crate::registry::NodeRegistry;
use crate::scheduler::job::{Job, JobState};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// How queued time raises a job's effective priority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgingPolicy {
    pub rate_per_minute: f64,
    pub max_boost: u32,
}

impl AgingPolicy {
    pub const DISABLED: AgingPolicy = AgingPolicy {
        rate_per_minute: 0.0,
        max_boost: 0,
    };

    pub fn boost(&self, queued_for: chrono::Duration) -> u32 {
        if self.rate_per_minute <= 0.0 {
            return 0;
        }
        let minutes = queued_for.num_milliseconds().max(0) as f64 / 60_000.0;
        let boost = (minutes * self.rate_per_minute).floor();
        if boost >= f64::from(self.max_boost) {
            self.max_boost
        } else {
            boost as u32
        }
    }
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            rate_per_minute: 1.0,
            max_boost: 1000,
        }
    }
}

/// Pending jobs waiting for a node.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    max_jobs: usize,
    aging: AgingPolicy,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
            aging: AgingPolicy::default(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::with_capacity(config.max_jobs).with_aging(AgingPolicy {
            rate_per_minute: config.aging_rate_per_minute,
            max_boost: config.max_aging_boost,
        })
    }

    pub fn with_aging(mut self, aging: AgingPolicy) -> Self {
        self.aging = aging;
        self
    }

    /// Admit a new submission. Requests that no registered node could hold
    /// even when idle are rejected outright instead of waiting forever.
    pub fn enqueue(&mut self, mut job: Job, registry: &NodeRegistry) -> Result<Uuid> {
        if !registry.can_ever_fit(&job.resources) {
            tracing::info!(
                job_id = %job.id,
                requested = %job.resources,
                max_capacity = %registry.max_capacity(),
                "Job rejected as unsatisfiable"
            );
            return Err(WlmError::Unsatisfiable {
                requested: job.resources,
            });
        }
        if self.is_full() {
            return Err(WlmError::QueueFull);
        }
        job.state = JobState::Pending;
        let id = job.id;
        self.jobs.insert(id, job);
        tracing::info!(job_id = %id, "Job queued");
        Ok(id)
    }

    /// Put back a job that was already admitted once, e.g. after a failed
    /// launch. Its submission time, and with it its aging, is preserved.
    pub fn requeue(&mut self, mut job: Job) -> Result<()> {
        if job.state != JobState::Pending {
            job.transition(JobState::Pending)?;
        }
        job.assigned_node = None;
        job.allocation_id = None;
        job.scheduled_at = None;
        job.started_at = None;
        tracing::info!(job_id = %job.id, attempts = job.launch_attempts, "Job requeued");
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn effective_priority(&self, job: &Job, now: DateTime<Utc>) -> u64 {
        u64::from(job.priority) + u64::from(self.aging.boost(now - job.submitted_at))
    }

    /// Pending jobs in dispatch order: effective priority (highest first),
    /// then submission time (oldest first), then id.
    pub fn peek_ready(&self, now: DateTime<Utc>) -> Vec<&Job> {
        let mut ready: Vec<(u64, &Job)> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .map(|j| (self.effective_priority(j, now), j))
            .collect();
        ready.sort_by(|(pa, a), (pb, b)| {
            pb.cmp(pa)
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ready.into_iter().map(|(_, j)| j).collect()
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        self.jobs.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.jobs.contains_key(id)
    }

    /// Every queued job, oldest submission first.
    pub fn jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| (j.submitted_at, j.id));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
