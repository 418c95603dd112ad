use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatch::client::{LaunchSpec, NodeClient, NodeEndpoint};
use crate::error::{Result, WlmError};
use crate::scheduler::Job;

/// Outcome of a call made on a node, delivered back to the controller.
#[derive(Debug)]
pub enum DispatchEvent {
    Launched {
        job_id: Uuid,
        node_id: String,
        /// Identifies which placement of the job this launch was for.
        allocation_id: Uuid,
        result: Result<()>,
    },
    Terminated {
        job_id: Uuid,
        node_id: String,
        result: Result<bool>,
    },
}

/// A launch in flight.
#[derive(Debug)]
pub struct DispatchHandle {
    pub job_id: Uuid,
    pub node_id: String,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the outcome has been handed to the controller.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

pub type CancelReply = oneshot::Sender<Result<Job>>;

/// Tracks calls to nodes: launches in flight, per-node timeout streaks and
/// the callers waiting for a cancellation to be confirmed.
pub struct Dispatcher {
    client: Arc<dyn NodeClient>,
    config: DispatchConfig,
    events: mpsc::UnboundedSender<DispatchEvent>,
    in_flight: HashMap<Uuid, AbortHandle>,
    timeouts: HashMap<String, u32>,
    cancel_waiters: HashMap<Uuid, Vec<CancelReply>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn NodeClient>,
        config: DispatchConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            client,
            config,
            events,
            in_flight: HashMap::new(),
            timeouts: HashMap::new(),
            cancel_waiters: HashMap::new(),
        };
        (dispatcher, events_rx)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Start launching `job` on `node` in the background.
    pub fn launch(&mut self, job: &Job, node: NodeEndpoint) -> Result<DispatchHandle> {
        let allocation_id = job.allocation_id.ok_or_else(|| {
            WlmError::Internal(format!("job {} has no allocation to launch", job.id))
        })?;
        let spec = LaunchSpec::from(job);
        let client = self.client.clone();
        let events = self.events.clone();
        let launch_timeout = self.config.launch_timeout();
        let node_id = node.node_id.clone();

        tracing::info!(job_id = %job.id, node_id = %node_id, address = %node.address, "Launching job");
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(launch_timeout, client.launch(&node, &spec)).await
            {
                Ok(result) => result,
                Err(_) => Err(WlmError::DispatchTimeout(node.node_id.clone())),
            };
            let _ = events.send(DispatchEvent::Launched {
                job_id: spec.job_id,
                node_id: node.node_id,
                allocation_id,
                result,
            });
        });

        self.in_flight.insert(job.id, task.abort_handle());
        Ok(DispatchHandle {
            job_id: job.id,
            node_id,
            task,
        })
    }

    /// Called when a launch outcome arrives. Returns true when the node has
    /// now timed out often enough in a row to be treated as unreachable.
    pub fn record_launch(&mut self, job_id: &Uuid, node_id: &str, result: &Result<()>) -> bool {
        self.in_flight.remove(job_id);
        match result {
            Ok(()) => {
                self.timeouts.remove(node_id);
                false
            }
            Err(WlmError::DispatchTimeout(_)) | Err(WlmError::NodeUnreachable { .. }) => {
                let streak = self.timeouts.entry(node_id.to_string()).or_insert(0);
                *streak += 1;
                tracing::warn!(node_id, streak = *streak, "Dispatch to node failed to connect or timed out");
                *streak >= self.config.unreachable_threshold.max(1)
            }
            Err(_) => false,
        }
    }

    /// Ask `node` to stop `job_id` in the background.
    pub fn terminate(&self, job_id: Uuid, node: NodeEndpoint) {
        let client = self.client.clone();
        let events = self.events.clone();
        let terminate_timeout = self.config.terminate_timeout();

        tracing::info!(job_id = %job_id, node_id = %node.node_id, "Terminating job");
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(terminate_timeout, client.terminate(&node, job_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(WlmError::DispatchTimeout(node.node_id.clone())),
                };
            let _ = events.send(DispatchEvent::Terminated {
                job_id,
                node_id: node.node_id,
                result,
            });
        });
    }

    pub fn add_cancel_waiter(&mut self, job_id: Uuid, reply: CancelReply) {
        self.cancel_waiters.entry(job_id).or_default().push(reply);
    }

    pub fn has_cancel_waiters(&self, job_id: &Uuid) -> bool {
        self.cancel_waiters.contains_key(job_id)
    }

    /// Answer everyone waiting on the cancellation of `job_id`.
    pub fn resolve_cancel(&mut self, job_id: &Uuid, outcome: std::result::Result<&Job, &WlmError>) {
        let Some(waiters) = self.cancel_waiters.remove(job_id) else {
            return;
        };
        for waiter in waiters {
            let reply = match outcome {
                Ok(job) => Ok(job.clone()),
                Err(WlmError::DispatchTimeout(node_id)) => {
                    Err(WlmError::DispatchTimeout(node_id.clone()))
                }
                Err(WlmError::NodeUnreachable { node_id, reason }) => {
                    Err(WlmError::NodeUnreachable {
                        node_id: node_id.clone(),
                        reason: reason.clone(),
                    })
                }
                Err(e) => Err(WlmError::Internal(format!("cancel of job {job_id} failed: {e}"))),
            };
            let _ = waiter.send(reply);
        }
    }

    pub fn forget_node(&mut self, node_id: &str) {
        self.timeouts.remove(node_id);
    }

    pub fn timeout_streak(&self, node_id: &str) -> u32 {
        self.timeouts.get(node_id).copied().unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Abort outstanding launches.
    pub fn shutdown(&mut self) {
        for (job_id, handle) in self.in_flight.drain() {
            tracing::debug!(job_id = %job_id, "Aborting in-flight launch");
            handle.abort();
        }
    }
}
