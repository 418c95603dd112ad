use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use uuid::Uuid;

use crate::error::{Result, WlmError};
use crate::grpc::interceptor::CredentialInjector;
use crate::proto::agent_service_client::AgentServiceClient;
use crate::proto::{LaunchJobRequest, TerminateJobRequest};
use crate::resources::ResourceVector;
use crate::scheduler::Job;

/// Where to reach a node's agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub node_id: String,
    pub address: String,
}

impl NodeEndpoint {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
        }
    }

    /// Address as a URI, adding `http://` when no scheme is given.
    pub fn uri(&self) -> String {
        if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("http://{}", self.address)
        }
    }
}

/// Everything an agent needs to start a job.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub job_id: Uuid,
    pub owner: String,
    pub command: String,
    pub resources: ResourceVector,
    pub time_limit_secs: u64,
}

impl From<&Job> for LaunchSpec {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            owner: job.owner.clone(),
            command: job.command.clone(),
            resources: job.resources,
            time_limit_secs: job.time_limit_secs,
        }
    }
}

/// Calls from the controller to node agents.
#[tonic::async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Ask the node to start the job. Returns once the node has accepted it.
    async fn launch(&self, node: &NodeEndpoint, spec: &LaunchSpec) -> Result<()>;

    /// Ask the node to stop the job. Returns whether it was still running.
    async fn terminate(&self, node: &NodeEndpoint, job_id: Uuid) -> Result<bool>;
}

type AgentClient = AgentServiceClient<InterceptedService<Channel, CredentialInjector>>;

/// [`NodeClient`] over gRPC with one cached channel per node.
pub struct GrpcNodeClient {
    credentials: CredentialInjector,
    connect_timeout: Duration,
    pool: Arc<Mutex<HashMap<String, (String, AgentClient)>>>,
}

impl GrpcNodeClient {
    pub fn new(credentials: CredentialInjector, connect_timeout: Duration) -> Self {
        Self {
            credentials,
            connect_timeout,
            pool: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get or create a cached connection to a node's agent.
    async fn client(&self, node: &NodeEndpoint) -> Result<AgentClient> {
        let mut pool = self.pool.lock().await;

        if let Some((address, client)) = pool.get(&node.node_id) {
            if *address == node.address {
                return Ok(client.clone());
            }
        }

        let endpoint = Endpoint::from_shared(node.uri())
            .map_err(|e| WlmError::NodeUnreachable {
                node_id: node.node_id.clone(),
                reason: format!("invalid address {}: {e}", node.address),
            })?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| WlmError::NodeUnreachable {
                node_id: node.node_id.clone(),
                reason: e.to_string(),
            })?;
        let client = AgentServiceClient::with_interceptor(channel, self.credentials.clone());

        pool.insert(node.node_id.clone(), (node.address.clone(), client.clone()));
        Ok(client)
    }

    async fn evict(&self, node_id: &str) {
        self.pool.lock().await.remove(node_id);
    }

    async fn map_status(&self, node: &NodeEndpoint, status: tonic::Status) -> WlmError {
        match status.code() {
            tonic::Code::Unavailable | tonic::Code::Unknown | tonic::Code::Cancelled => {
                self.evict(&node.node_id).await;
                WlmError::NodeUnreachable {
                    node_id: node.node_id.clone(),
                    reason: status.message().to_string(),
                }
            }
            tonic::Code::DeadlineExceeded => WlmError::DispatchTimeout(node.node_id.clone()),
            _ => WlmError::LaunchRejected {
                node_id: node.node_id.clone(),
                reason: status.message().to_string(),
            },
        }
    }
}

#[tonic::async_trait]
impl NodeClient for GrpcNodeClient {
    async fn launch(&self, node: &NodeEndpoint, spec: &LaunchSpec) -> Result<()> {
        let mut client = self.client(node).await?;
        let request = LaunchJobRequest {
            job_id: spec.job_id.to_string(),
            owner: spec.owner.clone(),
            command: spec.command.clone(),
            resources: Some(spec.resources.into()),
            time_limit_secs: spec.time_limit_secs,
        };
        let response = match client.launch_job(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => return Err(self.map_status(node, status).await),
        };
        if response.accepted {
            Ok(())
        } else {
            Err(WlmError::LaunchRejected {
                node_id: node.node_id.clone(),
                reason: response.message,
            })
        }
    }

    async fn terminate(&self, node: &NodeEndpoint, job_id: Uuid) -> Result<bool> {
        let mut client = self.client(node).await?;
        match client
            .terminate_job(TerminateJobRequest {
                job_id: job_id.to_string(),
            })
            .await
        {
            Ok(response) => Ok(response.into_inner().was_running),
            Err(status) => Err(self.map_status(node, status).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uri_adds_scheme_once() {
        assert_eq!(
            NodeEndpoint::new("n1", "10.0.0.1:6818").uri(),
            "http://10.0.0.1:6818"
        );
        assert_eq!(
            NodeEndpoint::new("n1", "https://node1:6818").uri(),
            "https://node1:6818"
        );
    }

    #[test]
    fn launch_spec_from_job() {
        let job = Job::new(
            "alice",
            crate::scheduler::JobSpec::new("echo hi", ResourceVector::new(2, 64, 0)),
            90,
        );
        let spec = LaunchSpec::from(&job);
        assert_eq!(spec.job_id, job.id);
        assert_eq!(spec.owner, "alice");
        assert_eq!(spec.time_limit_secs, 90);
        assert_eq!(spec.resources, ResourceVector::new(2, 64, 0));
    }
}
