//! The controller task.
//!
//! All cluster state lives in one [`ClusterState`] owned by the controller's
//! event loop. API handlers talk to it through a [`ControllerHandle`], which
//! turns each call into a [`ControllerMessage`] carrying a oneshot reply
//! channel. Node calls made by the dispatcher report back on a second
//! channel. A scheduling pass runs on a fixed period and right after any
//! message that changes the queue or the free capacity.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accounting::{AccountingStore, JobRecord, RecordFilter};
use crate::auth::Principal;
use crate::cluster::{ClusterState, Displaced, JobFilter, NodeStatus};
use crate::config::{ControllerConfig, NodeFailurePolicy};
use crate::dispatch::{DispatchEvent, Dispatcher, NodeClient, NodeEndpoint};
use crate::error::{Result, WlmError};
use crate::registry::{Heartbeat, HeartbeatOutcome, Node, NodeState};
use crate::resources::ResourceVector;
use crate::scheduler::{Job, JobSpec, JobState};

/// A node's report that one of its jobs ended.
#[derive(Debug, Clone)]
pub struct JobExit {
    pub job_id: Uuid,
    pub node_id: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReply {
    pub accepted: bool,
    pub state: NodeState,
}

/// Requests handled by the controller loop.
#[derive(Debug)]
pub enum ControllerMessage {
    Submit {
        owner: String,
        spec: JobSpec,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    GetJob {
        job_id: Uuid,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    ListJobs {
        filter: JobFilter,
        response_tx: oneshot::Sender<Vec<Job>>,
    },
    /// Answered once the job is actually cancelled, which for a running job
    /// means after its node confirms.
    CancelJob {
        principal: Principal,
        job_id: Uuid,
        response_tx: oneshot::Sender<Result<Job>>,
    },
    RegisterNode {
        node_id: String,
        capacity: ResourceVector,
        address: Option<String>,
        response_tx: oneshot::Sender<Result<Node>>,
    },
    Heartbeat {
        beat: Heartbeat,
        response_tx: oneshot::Sender<Result<HeartbeatReply>>,
    },
    JobExit {
        report: JobExit,
        response_tx: oneshot::Sender<Result<bool>>,
    },
    ListNodes {
        response_tx: oneshot::Sender<Vec<NodeStatus>>,
    },
    DrainNode {
        node_id: String,
        response_tx: oneshot::Sender<Result<Node>>,
    },
    ResumeNode {
        node_id: String,
        response_tx: oneshot::Sender<Result<Node>>,
    },
    RemoveNode {
        node_id: String,
        response_tx: oneshot::Sender<Result<Node>>,
    },
    History {
        filter: RecordFilter,
        response_tx: oneshot::Sender<Vec<JobRecord>>,
    },
}

pub struct Controller {
    config: ControllerConfig,
    state: ClusterState,
    dispatcher: Dispatcher,
    inbox: mpsc::Receiver<ControllerMessage>,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        client: Arc<dyn NodeClient>,
        accounting: AccountingStore,
    ) -> (Self, ControllerHandle) {
        let (tx, inbox) = mpsc::channel(config.channel_capacity.max(1));
        let (dispatcher, events) = Dispatcher::new(client, config.dispatch.clone());
        let handle = ControllerHandle {
            tx,
            request_timeout: config.request_timeout(),
        };
        let controller = Self {
            state: ClusterState::new(&config, accounting),
            config,
            dispatcher,
            inbox,
            events,
        };
        (controller, handle)
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut cycle = tokio::time::interval(Duration::from_millis(
            self.config.scheduler.cycle_interval_ms.max(1),
        ));
        cycle.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health = tokio::time::interval(Duration::from_millis(
            self.config.registry.heartbeat_interval_ms.max(1),
        ));
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            backfill = self.config.scheduler.backfill,
            cycle_interval_ms = self.config.scheduler.cycle_interval_ms,
            "Controller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(msg) = self.inbox.recv() => {
                    if self.handle_message(msg).await {
                        self.schedule().await;
                    }
                }

                Some(event) = self.events.recv() => {
                    if self.handle_event(event).await {
                        self.schedule().await;
                    }
                }

                _ = health.tick() => {
                    if self.check_health().await {
                        self.schedule().await;
                    }
                }

                _ = cycle.tick() => self.schedule().await,
            }
        }

        self.dispatcher.shutdown();
        tracing::info!(
            pending = self.state.queue().len(),
            "Controller stopped"
        );
    }

    /// Returns true when the change may let more jobs be placed.
    async fn handle_message(&mut self, msg: ControllerMessage) -> bool {
        let now = Utc::now();
        match msg {
            ControllerMessage::Submit {
                owner,
                spec,
                response_tx,
            } => {
                let result = self.state.submit(&owner, spec, now);
                let queued = result.is_ok();
                if let Ok(job) = &result {
                    tracing::info!(job_id = %job.id, owner = %job.owner, resources = %job.resources, priority = job.priority, "Job submitted");
                }
                let _ = response_tx.send(result);
                queued
            }
            ControllerMessage::GetJob {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(
                    self.state
                        .find_job(&job_id)
                        .ok_or(WlmError::JobNotFound(job_id)),
                );
                false
            }
            ControllerMessage::ListJobs {
                filter,
                response_tx,
            } => {
                let _ = response_tx.send(self.state.list_jobs(&filter));
                false
            }
            ControllerMessage::CancelJob {
                principal,
                job_id,
                response_tx,
            } => self.cancel(principal, job_id, response_tx, now).await,
            ControllerMessage::RegisterNode {
                node_id,
                capacity,
                address,
                response_tx,
            } => {
                let node = self.state.register_node(&node_id, capacity, address, now);
                self.dispatcher.forget_node(&node_id);
                let _ = response_tx.send(Ok(node));
                true
            }
            ControllerMessage::Heartbeat { beat, response_tx } => {
                let node_id = beat.node_id.clone();
                match self.state.heartbeat(beat, now) {
                    Ok((outcome, state)) => {
                        if let HeartbeatOutcome::Accepted {
                            previous,
                            current: NodeState::Down,
                        } = outcome
                        {
                            if previous != NodeState::Down {
                                self.node_lost(&node_id, "node reported down").await;
                            }
                        }
                        let accepted = outcome != HeartbeatOutcome::Stale;
                        let _ = response_tx.send(Ok(HeartbeatReply { accepted, state }));
                        accepted
                    }
                    Err(e) => {
                        let _ = response_tx.send(Err(e));
                        false
                    }
                }
            }
            ControllerMessage::JobExit {
                report,
                response_tx,
            } => {
                let result = self.job_exited(report).await;
                let recorded = matches!(result, Ok(true));
                let _ = response_tx.send(result);
                recorded
            }
            ControllerMessage::ListNodes { response_tx } => {
                let _ = response_tx.send(self.state.node_status());
                false
            }
            ControllerMessage::DrainNode {
                node_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.state.drain_node(&node_id));
                false
            }
            ControllerMessage::ResumeNode {
                node_id,
                response_tx,
            } => {
                let result = self.state.resume_node(&node_id);
                let resumed = result.is_ok();
                let _ = response_tx.send(result);
                resumed
            }
            ControllerMessage::RemoveNode {
                node_id,
                response_tx,
            } => {
                if !self.state.registry().contains(&node_id) {
                    let _ = response_tx.send(Err(WlmError::NodeNotFound(node_id)));
                    return false;
                }
                // The agent may still be alive; stop its processes before the
                // jobs are placed elsewhere.
                if let Some(endpoint) = self.endpoint(&node_id) {
                    for job_id in self.state.jobs_on_node(&node_id) {
                        self.dispatcher.terminate(job_id, endpoint.clone());
                    }
                }
                self.node_lost(&node_id, "node removed").await;
                let result = self.state.remove_node(&node_id);
                self.dispatcher.forget_node(&node_id);
                let _ = response_tx.send(result);
                true
            }
            ControllerMessage::History {
                filter,
                response_tx,
            } => {
                let _ = response_tx.send(self.state.history(&filter));
                false
            }
        }
    }

    async fn cancel(
        &mut self,
        principal: Principal,
        job_id: Uuid,
        response_tx: oneshot::Sender<Result<Job>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(job) = self.state.find_job(&job_id) else {
            let _ = response_tx.send(Err(WlmError::JobNotFound(job_id)));
            return false;
        };
        if !principal.may_manage_job(&job.owner) {
            let _ = response_tx.send(Err(WlmError::PermissionDenied(format!(
                "{} may not cancel job {job_id} owned by {}",
                principal.name(),
                job.owner
            ))));
            return false;
        }

        match job.state {
            JobState::Pending => {
                let _ = response_tx.send(self.state.cancel_pending(&job_id, now).await);
                false
            }
            JobState::Scheduled => {
                // Resolved when the launch outcome arrives.
                if let Some(active) = self.state.active_job_mut(&job_id) {
                    active.cancel_requested = true;
                }
                self.dispatcher.add_cancel_waiter(job_id, response_tx);
                false
            }
            JobState::Running => {
                let already_requested = job.cancel_requested;
                let endpoint = job
                    .assigned_node
                    .as_deref()
                    .and_then(|node_id| self.endpoint(node_id));
                match endpoint {
                    Some(endpoint) => {
                        if let Some(active) = self.state.active_job_mut(&job_id) {
                            active.cancel_requested = true;
                        }
                        self.dispatcher.add_cancel_waiter(job_id, response_tx);
                        if !already_requested {
                            self.dispatcher.terminate(job_id, endpoint);
                        }
                        false
                    }
                    None => {
                        // Nothing to call: the node has no agent address.
                        let result = self
                            .state
                            .finish_job(
                                &job_id,
                                JobState::Cancelled,
                                None,
                                Some("cancelled by user".to_string()),
                                now,
                            )
                            .await;
                        let _ = response_tx.send(result);
                        true
                    }
                }
            }
            state => {
                let _ = response_tx.send(Err(WlmError::InvalidTransition {
                    job_id,
                    from: state,
                    to: JobState::Cancelled,
                }));
                false
            }
        }
    }

    async fn job_exited(&mut self, report: JobExit) -> Result<bool> {
        let Some(job) = self.state.active_job(&report.job_id) else {
            tracing::warn!(job_id = %report.job_id, node_id = %report.node_id, "Exit report for unknown job ignored");
            return Ok(false);
        };
        if job.assigned_node.as_deref() != Some(report.node_id.as_str()) {
            tracing::warn!(
                job_id = %report.job_id,
                node_id = %report.node_id,
                assigned = ?job.assigned_node,
                "Exit report from a node not running the job ignored"
            );
            return Ok(false);
        }
        if !report.state.is_terminal() {
            return Err(WlmError::InvalidJob(format!(
                "exit report carries non-terminal state {}",
                report.state
            )));
        }
        if job.state == JobState::Scheduled {
            // The exit overtook the launch acknowledgement.
            self.state.mark_running(&report.job_id, report.ended_at)?;
        }

        let job = self
            .state
            .finish_job(
                &report.job_id,
                report.state,
                report.exit_code,
                report.error,
                report.ended_at,
            )
            .await?;
        self.dispatcher.resolve_cancel(&job.id, Ok(&job));
        Ok(true)
    }

    async fn handle_event(&mut self, event: DispatchEvent) -> bool {
        match event {
            DispatchEvent::Launched {
                job_id,
                node_id,
                allocation_id,
                result,
            } => {
                let unreachable = self.dispatcher.record_launch(&job_id, &node_id, &result);
                self.launch_finished(job_id, &node_id, allocation_id, result)
                    .await;
                if unreachable {
                    self.node_unreachable(&node_id).await;
                }
                true
            }
            DispatchEvent::Terminated {
                job_id,
                node_id,
                result,
            } => self.terminate_finished(job_id, &node_id, result).await,
        }
    }

    async fn launch_finished(
        &mut self,
        job_id: Uuid,
        node_id: &str,
        allocation_id: Uuid,
        result: Result<()>,
    ) {
        let now = Utc::now();
        let current = self
            .state
            .active_job(&job_id)
            .filter(|j| j.allocation_id == Some(allocation_id) && j.state == JobState::Scheduled)
            .cloned();

        match (current, result) {
            (Some(_), Ok(())) => match self.state.mark_running(&job_id, now) {
                Ok(job) => {
                    tracing::info!(job_id = %job_id, node_id, "Job running");
                    if job.cancel_requested {
                        if let Some(endpoint) = self.endpoint(node_id) {
                            self.dispatcher.terminate(job_id, endpoint);
                        }
                    }
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Launched job could not start"),
            },
            (Some(job), Err(e)) => {
                tracing::warn!(job_id = %job_id, node_id, error = %e, "Launch failed");
                if job.cancel_requested {
                    let result = self
                        .state
                        .finish_job(
                            &job_id,
                            JobState::Cancelled,
                            None,
                            Some("cancelled before start".to_string()),
                            now,
                        )
                        .await;
                    self.resolve_cancel(&job_id, &result);
                    return;
                }
                let reason = format!("launch on {node_id} failed: {e}");
                let max_attempts = self.config.dispatch.max_launch_attempts;
                if let Err(e) = self
                    .state
                    .requeue_or_fail(&job_id, &reason, max_attempts, now)
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Could not recover from failed launch");
                }
            }
            (None, Ok(())) => {
                // The job moved on while the launch was in flight. Make sure
                // the node does not keep running a stale copy.
                let placed_here = self
                    .state
                    .active_job(&job_id)
                    .is_some_and(|j| j.assigned_node.as_deref() == Some(node_id));
                if !placed_here {
                    if let Some(endpoint) = self.endpoint(node_id) {
                        tracing::info!(job_id = %job_id, node_id, "Stopping stale launch");
                        self.dispatcher.terminate(job_id, endpoint);
                    }
                }
            }
            (None, Err(e)) => {
                tracing::debug!(job_id = %job_id, node_id, error = %e, "Stale launch failure ignored");
            }
        }
    }

    async fn terminate_finished(&mut self, job_id: Uuid, node_id: &str, result: Result<bool>) -> bool {
        let job = self
            .state
            .active_job(&job_id)
            .filter(|j| j.assigned_node.as_deref() == Some(node_id) && j.cancel_requested)
            .cloned();
        let Some(job) = job else {
            tracing::debug!(job_id = %job_id, node_id, "Terminate outcome for inactive job");
            return false;
        };

        match result {
            Ok(was_running) => {
                tracing::info!(job_id = %job_id, node_id, was_running, "Node confirmed termination");
                let result = self
                    .state
                    .finish_job(
                        &job.id,
                        JobState::Cancelled,
                        None,
                        Some("cancelled by user".to_string()),
                        Utc::now(),
                    )
                    .await;
                self.resolve_cancel(&job_id, &result);
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, node_id, error = %e, "Terminate failed");
                if let Some(active) = self.state.active_job_mut(&job_id) {
                    active.cancel_requested = false;
                }
                self.dispatcher.resolve_cancel(&job_id, Err(&e));
                false
            }
        }
    }

    fn resolve_cancel(&mut self, job_id: &Uuid, result: &Result<Job>) {
        match result {
            Ok(job) => self.dispatcher.resolve_cancel(job_id, Ok(job)),
            Err(e) => self.dispatcher.resolve_cancel(job_id, Err(e)),
        }
    }

    /// Mark silent nodes down and displace their jobs.
    async fn check_health(&mut self) -> bool {
        let down = self.state.check_timeouts(Utc::now());
        for node_id in &down {
            self.node_lost(node_id, "heartbeat timeout").await;
        }
        !down.is_empty()
    }

    async fn node_unreachable(&mut self, node_id: &str) {
        match self.state.mark_node_down(node_id, "dispatch timeouts") {
            Ok(true) => self.node_lost(node_id, "node unreachable").await,
            Ok(false) => {}
            Err(e) => tracing::debug!(node_id, error = %e, "Unreachable node already gone"),
        }
    }

    /// Apply the node failure policy to every job placed on `node_id`.
    async fn node_lost(&mut self, node_id: &str, reason: &str) {
        let now = Utc::now();
        let policy = self.config.dispatch.node_failure_policy;
        let max_attempts = self.config.dispatch.max_launch_attempts;
        let reason = format!("{reason} on node {node_id}");

        for job_id in self.state.jobs_on_node(node_id) {
            let cancel_requested = self
                .state
                .active_job(&job_id)
                .is_some_and(|j| j.cancel_requested);

            let result = if cancel_requested {
                self.state
                    .finish_job(&job_id, JobState::Cancelled, None, Some(reason.clone()), now)
                    .await
            } else {
                match policy {
                    NodeFailurePolicy::Requeue => self
                        .state
                        .requeue_or_fail(&job_id, &reason, max_attempts, now)
                        .await
                        .map(|displaced| match displaced {
                            Displaced::Requeued(job) | Displaced::Finished(job) => job,
                        }),
                    NodeFailurePolicy::Fail => {
                        self.state
                            .finish_job(&job_id, JobState::Failed, None, Some(reason.clone()), now)
                            .await
                    }
                }
            };

            match &result {
                Ok(job) => tracing::warn!(job_id = %job_id, node_id, state = %job.state, "Job displaced by node loss"),
                Err(e) => tracing::error!(job_id = %job_id, node_id, error = %e, "Failed to displace job"),
            }
            self.resolve_cancel(&job_id, &result);
        }
        self.dispatcher.forget_node(node_id);
    }

    /// Run a scheduling pass and start launches for whatever it placed.
    async fn schedule(&mut self) {
        let now = Utc::now();
        for job in self.state.run_cycle(now) {
            let Some(node_id) = job.assigned_node.clone() else {
                continue;
            };
            let launched = match self.endpoint(&node_id) {
                Some(endpoint) => self.dispatcher.launch(&job, endpoint).map(|_| ()),
                None => Err(WlmError::NodeUnreachable {
                    node_id: node_id.clone(),
                    reason: "node has no agent address".to_string(),
                }),
            };
            if let Err(e) = launched {
                let reason = format!("launch on {node_id} failed: {e}");
                let max_attempts = self.config.dispatch.max_launch_attempts;
                if let Err(e) = self
                    .state
                    .requeue_or_fail(&job.id, &reason, max_attempts, now)
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Could not recover from failed launch");
                }
            }
        }
    }

    fn endpoint(&self, node_id: &str) -> Option<NodeEndpoint> {
        let node = self.state.registry().get(node_id).ok()?;
        let address = node.address.clone()?;
        Some(NodeEndpoint::new(node_id, address))
    }
}

/// Cheap, cloneable client of the controller loop.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMessage>,
    request_timeout: Duration,
}

impl ControllerHandle {
    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(WlmError::ControllerUnavailable),
            Err(_) => Err(WlmError::Busy),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        match tokio::time::timeout(self.request_timeout, self.tx.send(build(tx))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(WlmError::ControllerUnavailable),
            Err(_) => return Err(WlmError::Busy),
        }
        self.await_reply(rx).await
    }

    /// Submit a job. Fails fast with `Busy` when the controller is saturated.
    pub async fn submit(&self, owner: &str, spec: JobSpec) -> Result<Job> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .try_send(ControllerMessage::Submit {
                owner: owner.to_string(),
                spec,
                response_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WlmError::Busy,
                mpsc::error::TrySendError::Closed(_) => WlmError::ControllerUnavailable,
            })?;
        self.await_reply(rx).await?
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.request(|response_tx| ControllerMessage::GetJob {
            job_id,
            response_tx,
        })
        .await?
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.request(|response_tx| ControllerMessage::ListJobs {
            filter,
            response_tx,
        })
        .await
    }

    pub async fn cancel_job(&self, principal: Principal, job_id: Uuid) -> Result<Job> {
        self.request(|response_tx| ControllerMessage::CancelJob {
            principal,
            job_id,
            response_tx,
        })
        .await?
    }

    pub async fn register_node(
        &self,
        node_id: &str,
        capacity: ResourceVector,
        address: Option<String>,
    ) -> Result<Node> {
        self.request(|response_tx| ControllerMessage::RegisterNode {
            node_id: node_id.to_string(),
            capacity,
            address,
            response_tx,
        })
        .await?
    }

    pub async fn heartbeat(&self, beat: Heartbeat) -> Result<HeartbeatReply> {
        self.request(|response_tx| ControllerMessage::Heartbeat { beat, response_tx })
            .await?
    }

    /// Returns whether the report was applied.
    pub async fn report_exit(&self, report: JobExit) -> Result<bool> {
        self.request(|response_tx| ControllerMessage::JobExit {
            report,
            response_tx,
        })
        .await?
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        self.request(|response_tx| ControllerMessage::ListNodes { response_tx })
            .await
    }

    pub async fn drain_node(&self, node_id: &str) -> Result<Node> {
        self.request(|response_tx| ControllerMessage::DrainNode {
            node_id: node_id.to_string(),
            response_tx,
        })
        .await?
    }

    pub async fn resume_node(&self, node_id: &str) -> Result<Node> {
        self.request(|response_tx| ControllerMessage::ResumeNode {
            node_id: node_id.to_string(),
            response_tx,
        })
        .await?
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<Node> {
        self.request(|response_tx| ControllerMessage::RemoveNode {
            node_id: node_id.to_string(),
            response_tx,
        })
        .await?
    }

    pub async fn history(&self, filter: RecordFilter) -> Result<Vec<JobRecord>> {
        self.request(|response_tx| ControllerMessage::History {
            filter,
            response_tx,
        })
        .await
    }
}
