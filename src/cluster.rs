//! The controller's owned view of the cluster.
//!
//! `ClusterState` ties the registry, the pending queue, the jobs currently
//! holding resources, the ledger and the accounting store together and keeps
//! them consistent: a job leaves the active set in the same step its
//! allocation is released, and it is archived in the same step it becomes
//! terminal. Jobs and nodes refer to each other by id only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::accounting::{AccountingStore, JobRecord, RecordFilter};
use crate::config::ControllerConfig;
use crate::error::{Result, WlmError};
use crate::ledger::ResourceLedger;
use crate::registry::{Heartbeat, HeartbeatOutcome, Node, NodeRegistry, NodeState};
use crate::resources::ResourceVector;
use crate::scheduler::{Job, JobQueue, JobSpec, JobState, Scheduler};

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub owner: Option<String>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| job.state == s)
            && self.owner.as_deref().map_or(true, |o| job.owner == o)
    }
}

/// A node together with its ledger view.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node: Node,
    pub free: ResourceVector,
    pub allocated: ResourceVector,
    pub active_jobs: usize,
}

/// What became of a job that lost its placement.
#[derive(Debug, Clone, PartialEq)]
pub enum Displaced {
    Requeued(Job),
    Finished(Job),
}

impl Displaced {
    pub fn job(&self) -> &Job {
        match self {
            Displaced::Requeued(job) | Displaced::Finished(job) => job,
        }
    }
}

#[derive(Debug)]
pub struct ClusterState {
    registry: NodeRegistry,
    queue: JobQueue,
    /// Jobs that hold an allocation: `Scheduled` or `Running`.
    active: HashMap<Uuid, Job>,
    ledger: Arc<ResourceLedger>,
    accounting: AccountingStore,
    /// Terminal jobs whose accounting write failed. Still answer status
    /// queries until the controller stops.
    unrecorded: HashMap<Uuid, Job>,
    scheduler: Scheduler,
    default_time_limit_secs: u64,
}

impl ClusterState {
    pub fn new(config: &ControllerConfig, accounting: AccountingStore) -> Self {
        Self {
            registry: NodeRegistry::new(config.registry.heartbeat_timeout()),
            queue: JobQueue::from_config(&config.scheduler),
            active: HashMap::new(),
            ledger: Arc::new(ResourceLedger::new()),
            accounting,
            unrecorded: HashMap::new(),
            scheduler: Scheduler::new(&config.scheduler),
            default_time_limit_secs: config.scheduler.default_time_limit_secs,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn accounting(&self) -> &AccountingStore {
        &self.accounting
    }

    /// Validate and queue a new submission.
    pub fn submit(&mut self, owner: &str, spec: JobSpec, now: DateTime<Utc>) -> Result<Job> {
        spec.validate()?;
        let job = Job::with_id(
            Uuid::new_v4(),
            owner,
            spec,
            self.default_time_limit_secs,
            now,
        );
        self.queue.enqueue(job.clone(), &self.registry)?;
        Ok(job)
    }

    pub fn register_node(
        &mut self,
        node_id: &str,
        capacity: ResourceVector,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Node {
        let node = self.registry.register(node_id, capacity, address, now).clone();
        self.ledger.upsert_node(node_id, node.capacity);
        node
    }

    /// Apply a heartbeat and keep the ledger's capacity in step with it.
    pub fn heartbeat(
        &mut self,
        beat: Heartbeat,
        now: DateTime<Utc>,
    ) -> Result<(HeartbeatOutcome, NodeState)> {
        let node_id = beat.node_id.clone();
        let outcome = self.registry.heartbeat(beat, now)?;
        let node = self.registry.get(&node_id)?;
        if outcome != HeartbeatOutcome::Stale {
            self.ledger.upsert_node(&node_id, node.capacity);
        }
        Ok((outcome, node.state))
    }

    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.registry.check_timeouts(now)
    }

    pub fn mark_node_down(&mut self, node_id: &str, reason: &str) -> Result<bool> {
        self.registry.mark_down(node_id, reason)
    }

    pub fn drain_node(&mut self, node_id: &str) -> Result<Node> {
        self.registry.drain(node_id).cloned()
    }

    pub fn resume_node(&mut self, node_id: &str) -> Result<Node> {
        self.registry.resume(node_id).cloned()
    }

    /// Forget a node. Jobs still placed on it must be displaced first.
    pub fn remove_node(&mut self, node_id: &str) -> Result<Node> {
        let node = self.registry.remove(node_id)?;
        let orphaned = self.ledger.remove_node(node_id);
        if !orphaned.is_empty() {
            tracing::warn!(node_id, count = orphaned.len(), "Removed node still held allocations");
        }
        Ok(node)
    }

    pub fn node_status(&self) -> Vec<NodeStatus> {
        self.registry
            .nodes()
            .map(|node| NodeStatus {
                node: node.clone(),
                free: self.ledger.free(&node.id).unwrap_or(ResourceVector::ZERO),
                allocated: self.ledger.allocated(&node.id).unwrap_or(ResourceVector::ZERO),
                active_jobs: self
                    .active
                    .values()
                    .filter(|j| j.assigned_node.as_deref() == Some(node.id.as_str()))
                    .count(),
            })
            .collect()
    }

    /// Run one scheduling pass. Matched jobs move into the active set.
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        let outcome = self
            .scheduler
            .run_cycle(&self.registry, &mut self.queue, &self.ledger, now);
        outcome
            .assignments
            .into_iter()
            .map(|assignment| {
                let job = assignment.job;
                self.active.insert(job.id, job.clone());
                job
            })
            .collect()
    }

    pub fn active_job(&self, job_id: &Uuid) -> Option<&Job> {
        self.active.get(job_id)
    }

    pub fn active_job_mut(&mut self, job_id: &Uuid) -> Option<&mut Job> {
        self.active.get_mut(job_id)
    }

    /// Active jobs placed on `node_id`.
    pub fn jobs_on_node(&self, node_id: &str) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .active
            .values()
            .filter(|j| j.assigned_node.as_deref() == Some(node_id))
            .map(|j| j.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn mark_running(&mut self, job_id: &Uuid, now: DateTime<Utc>) -> Result<Job> {
        let job = self
            .active
            .get_mut(job_id)
            .ok_or(WlmError::JobNotFound(*job_id))?;
        job.transition(JobState::Running)?;
        job.started_at = Some(now);
        Ok(job.clone())
    }

    /// Look a job up wherever it currently lives.
    pub fn find_job(&self, job_id: &Uuid) -> Option<Job> {
        self.queue
            .get(job_id)
            .or_else(|| self.active.get(job_id))
            .or_else(|| self.unrecorded.get(job_id))
            .cloned()
            .or_else(|| self.accounting.get(job_id).map(|r| r.job.clone()))
    }

    /// Queued, active and finished jobs matching `filter`, oldest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .queue
            .jobs()
            .into_iter()
            .chain(self.active.values())
            .chain(self.unrecorded.values())
            .chain(self.accounting.records().iter().map(|r| &r.job))
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.submitted_at, j.id));
        jobs
    }

    pub fn history(&self, filter: &RecordFilter) -> Vec<JobRecord> {
        self.accounting.query(filter).into_iter().cloned().collect()
    }

    /// Cancel a job that has not been placed yet.
    pub async fn cancel_pending(&mut self, job_id: &Uuid, now: DateTime<Utc>) -> Result<Job> {
        let mut job = self
            .queue
            .remove(job_id)
            .ok_or(WlmError::JobNotFound(*job_id))?;
        if let Err(e) = job.transition(JobState::Cancelled) {
            let _ = self.queue.requeue(job);
            return Err(e);
        }
        job.ended_at = Some(now);
        job.reason = Some("cancelled before start".to_string());
        self.archive(job.clone()).await;
        Ok(job)
    }

    /// Move an active job to a terminal state, returning its resources.
    pub async fn finish_job(
        &mut self,
        job_id: &Uuid,
        state: JobState,
        exit_code: Option<i32>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        if !state.is_terminal() {
            return Err(WlmError::Internal(format!(
                "{state} is not a terminal state"
            )));
        }
        let mut job = self
            .active
            .remove(job_id)
            .ok_or(WlmError::JobNotFound(*job_id))?;
        if let Err(e) = job.transition(state) {
            self.active.insert(job.id, job);
            return Err(e);
        }
        self.release(&mut job);
        job.ended_at = Some(now);
        job.exit_code = exit_code;
        if reason.is_some() {
            job.reason = reason;
        }
        tracing::info!(
            job_id = %job.id,
            state = %job.state,
            exit_code = ?job.exit_code,
            node_id = ?job.assigned_node,
            "Job finished"
        );
        self.archive(job.clone()).await;
        Ok(job)
    }

    /// Take a job off its node after a failed launch or a lost node. It goes
    /// back to the queue while it has launch attempts left, otherwise it fails.
    pub async fn requeue_or_fail(
        &mut self,
        job_id: &Uuid,
        reason: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Displaced> {
        let mut job = self
            .active
            .remove(job_id)
            .ok_or(WlmError::JobNotFound(*job_id))?;
        self.release(&mut job);
        job.launch_attempts = job.launch_attempts.saturating_add(1);
        job.reason = Some(reason.to_string());

        if job.launch_attempts < max_attempts {
            self.queue.requeue(job.clone())?;
            let requeued = self.queue.get(job_id).cloned().unwrap_or(job);
            return Ok(Displaced::Requeued(requeued));
        }

        job.transition(JobState::Failed)?;
        job.ended_at = Some(now);
        job.reason = Some(format!(
            "{reason} (gave up after {} attempts)",
            job.launch_attempts
        ));
        tracing::warn!(job_id = %job.id, attempts = job.launch_attempts, "Job failed, launch attempts exhausted");
        self.archive(job.clone()).await;
        Ok(Displaced::Finished(job))
    }

    fn release(&self, job: &mut Job) {
        if let Some(allocation_id) = job.allocation_id.take() {
            if let Err(e) = self.ledger.release(allocation_id) {
                // Already gone when the node was removed.
                tracing::debug!(job_id = %job.id, error = %e, "Allocation already released");
            }
        }
    }

    async fn archive(&mut self, job: Job) {
        let job_id = job.id;
        match self.accounting.append(JobRecord::new(job.clone(), Utc::now())).await {
            Ok(()) => {}
            Err(WlmError::DuplicateRecord(_)) => {
                tracing::warn!(job_id = %job_id, "Job was already archived");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to write accounting record");
                self.unrecorded.insert(job_id, job);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn state_with_node(cpus: u32) -> ClusterState {
        let mut state = ClusterState::new(&ControllerConfig::default(), AccountingStore::in_memory());
        state.register_node("n1", ResourceVector::new(cpus, 4096, 0), Some("127.0.0.1:1".into()), t(0));
        state
    }

    fn spec(cpus: u32) -> JobSpec {
        JobSpec::new("sleep 1", ResourceVector::new(cpus, 0, 0))
    }

    #[test]
    fn submit_rejects_unsatisfiable_and_invalid() {
        let mut state = state_with_node(4);
        assert!(matches!(
            state.submit("alice", spec(8), t(1)),
            Err(WlmError::Unsatisfiable { .. })
        ));
        assert!(matches!(
            state.submit("alice", JobSpec::new("", ResourceVector::new(1, 0, 0)), t(1)),
            Err(WlmError::InvalidJob(_))
        ));
        assert!(state.queue().is_empty());
    }

    #[test]
    fn heartbeat_capacity_change_reaches_ledger() {
        let mut state = state_with_node(4);
        let beat = Heartbeat {
            node_id: "n1".into(),
            observed_state: NodeState::Up,
            capacity: Some(ResourceVector::new(8, 8192, 1)),
            address: None,
            sent_at: t(1),
        };
        let (outcome, current) = state.heartbeat(beat, t(1)).unwrap();
        assert!(matches!(outcome, HeartbeatOutcome::Accepted { .. }));
        assert_eq!(current, NodeState::Up);
        assert_eq!(state.ledger().capacity("n1"), Some(ResourceVector::new(8, 8192, 1)));
    }

    #[tokio::test]
    async fn cycle_then_finish_releases_and_archives() {
        let mut state = state_with_node(4);
        let job = state.submit("alice", spec(4), t(1)).unwrap();

        let placed = state.run_cycle(t(2));
        assert_eq!(placed.len(), 1);
        assert_eq!(state.ledger().free("n1").unwrap().cpus, 0);
        assert_eq!(state.jobs_on_node("n1"), vec![job.id]);

        state.mark_running(&job.id, t(3)).unwrap();
        let done = state
            .finish_job(&job.id, JobState::Completed, Some(0), None, t(13))
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.assigned_node.as_deref(), Some("n1"));
        assert!(done.allocation_id.is_none());
        assert_eq!(state.ledger().free("n1").unwrap().cpus, 4);
        assert_eq!(state.accounting().get(&job.id).unwrap().usage.cpu_seconds, 40);
        assert_eq!(state.find_job(&job.id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn requeue_until_attempts_run_out() {
        let mut state = state_with_node(2);
        let job = state.submit("alice", spec(2), t(1)).unwrap();

        state.run_cycle(t(2));
        let first = state
            .requeue_or_fail(&job.id, "launch failed", 2, t(3))
            .await
            .unwrap();
        assert!(matches!(first, Displaced::Requeued(_)));
        assert_eq!(first.job().state, JobState::Pending);
        assert_eq!(state.ledger().free("n1").unwrap().cpus, 2);

        state.run_cycle(t(4));
        let second = state
            .requeue_or_fail(&job.id, "launch failed", 2, t(5))
            .await
            .unwrap();
        let Displaced::Finished(failed) = second else {
            panic!("expected the job to fail");
        };
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.launch_attempts, 2);
        assert!(state.queue().is_empty());
        assert!(state.accounting().contains(&job.id));
    }

    #[tokio::test]
    async fn cancel_pending_archives_immediately() {
        let mut state = state_with_node(4);
        let job = state.submit("alice", spec(1), t(1)).unwrap();
        let cancelled = state.cancel_pending(&job.id, t(2)).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert!(state.queue().is_empty());
        assert_eq!(
            state.list_jobs(&JobFilter {
                state: Some(JobState::Cancelled),
                ..Default::default()
            })
            .len(),
            1
        );
    }

    #[test]
    fn remove_node_drops_its_books() {
        let mut state = state_with_node(4);
        state.remove_node("n1").unwrap();
        assert!(state.ledger().free("n1").is_none());
        assert!(state.node_status().is_empty());
        assert!(matches!(
            state.remove_node("n1"),
            Err(WlmError::NodeNotFound(_))
        ));
    }
}
