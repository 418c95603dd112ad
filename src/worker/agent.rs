use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Server};
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::auth::{node_subject, TokenAuthority};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::grpc::convert::{job_state_to_proto, parse_job_id};
use crate::grpc::interceptor::{principal, AuthInterceptor, CredentialInjector};
use crate::proto::agent_service_server::{AgentService, AgentServiceServer};
use crate::proto::node_service_client::NodeServiceClient;
use crate::proto::{
    JobExitReport, LaunchJobRequest, LaunchJobResponse, RegisterNodeRequest, TerminateJobRequest,
    TerminateJobResponse,
};
use crate::worker::executor::{ExecutionResult, JobExecutor};
use crate::worker::heartbeat::HeartbeatSender;
use crate::worker::ControllerClient;

/// How long a terminate call waits for the process to be reaped.
const TERMINATE_WAIT: Duration = Duration::from_secs(3);
const REGISTER_RETRY: Duration = Duration::from_secs(1);
const EXIT_REPORT_ATTEMPTS: u32 = 5;

#[derive(Clone)]
struct RunningJob {
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// The agent side of the node protocol: starts and stops job processes on
/// behalf of the controller and queues their exits for reporting.
#[derive(Clone)]
pub struct NodeAgent {
    node_id: String,
    executor: JobExecutor,
    running: Arc<Mutex<HashMap<Uuid, RunningJob>>>,
    exits: mpsc::UnboundedSender<ExecutionResult>,
}

impl NodeAgent {
    pub fn new(
        node_id: impl Into<String>,
        executor: JobExecutor,
    ) -> (Self, mpsc::UnboundedReceiver<ExecutionResult>) {
        let (exits, exits_rx) = mpsc::unbounded_channel();
        let agent = Self {
            node_id: node_id.into(),
            executor,
            running: Arc::new(Mutex::new(HashMap::new())),
            exits,
        };
        (agent, exits_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn running_jobs(&self) -> Vec<Uuid> {
        self.running.lock().await.keys().copied().collect()
    }

    /// Start the job unless it is already running here. Returns false for a
    /// duplicate launch.
    pub async fn start(&self, job_id: Uuid, command: String, time_limit: Duration) -> bool {
        let job = RunningJob {
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        {
            let mut running = self.running.lock().await;
            if running.contains_key(&job_id) {
                return false;
            }
            running.insert(job_id, job.clone());
        }

        let agent = self.clone();
        tokio::spawn(async move {
            let result = agent
                .executor
                .execute(job_id, &command, time_limit, job.cancel.clone())
                .await;
            agent.running.lock().await.remove(&job_id);
            job.finished.cancel();
            if agent.exits.send(result).is_err() {
                tracing::warn!(job_id = %job_id, "Exit reporter gone, dropping exit");
            }
        });
        true
    }

    /// Kill the job's process and wait briefly for it to be reaped.
    pub async fn stop(&self, job_id: &Uuid) -> bool {
        let job = self.running.lock().await.get(job_id).cloned();
        let Some(job) = job else {
            return false;
        };
        job.cancel.cancel();
        if tokio::time::timeout(TERMINATE_WAIT, job.finished.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(job_id = %job_id, "Job still running after terminate");
        }
        true
    }

    /// Kill every running job, e.g. on agent shutdown.
    pub async fn stop_all(&self) {
        let jobs: Vec<Uuid> = self.running_jobs().await;
        for job_id in jobs {
            self.stop(&job_id).await;
        }
    }
}

#[tonic::async_trait]
impl AgentService for NodeAgent {
    async fn launch_job(
        &self,
        request: Request<LaunchJobRequest>,
    ) -> std::result::Result<Response<LaunchJobResponse>, Status> {
        principal(&request)?.require_controller()?;
        let req = request.into_inner();
        let job_id = parse_job_id(&req.job_id)?;

        if req.command.trim().is_empty() {
            return Ok(Response::new(LaunchJobResponse {
                accepted: false,
                message: "Command cannot be empty".to_string(),
            }));
        }

        let limit = Duration::from_secs(req.time_limit_secs.max(1));
        let message = if self.start(job_id, req.command, limit).await {
            tracing::info!(job_id = %job_id, owner = %req.owner, "Launched job");
            "started".to_string()
        } else {
            tracing::debug!(job_id = %job_id, "Duplicate launch");
            "already running".to_string()
        };
        // A duplicate launch is still a success: the job is running here.
        Ok(Response::new(LaunchJobResponse {
            accepted: true,
            message,
        }))
    }

    async fn terminate_job(
        &self,
        request: Request<TerminateJobRequest>,
    ) -> std::result::Result<Response<TerminateJobResponse>, Status> {
        principal(&request)?.require_controller()?;
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let was_running = self.stop(&job_id).await;
        tracing::info!(job_id = %job_id, was_running, "Terminate requested");
        Ok(Response::new(TerminateJobResponse { was_running }))
    }
}

pub fn exit_report(node_id: &str, result: &ExecutionResult) -> JobExitReport {
    JobExitReport {
        job_id: result.job_id.to_string(),
        node_id: node_id.to_string(),
        state: job_state_to_proto(result.state) as i32,
        exit_code: result.exit_code,
        error: result.error.clone().unwrap_or_default(),
        ended_at_ms: result.ended_at.timestamp_millis(),
    }
}

/// Forward job exits to the controller, retrying transient failures.
async fn report_exits(
    mut client: ControllerClient,
    node_id: String,
    mut exits: mpsc::UnboundedReceiver<ExecutionResult>,
) {
    while let Some(result) = exits.recv().await {
        let report = exit_report(&node_id, &result);
        let mut backoff = Duration::from_millis(200);
        for attempt in 1..=EXIT_REPORT_ATTEMPTS {
            match client.report_job_exit(report.clone()).await {
                Ok(ack) => {
                    if !ack.into_inner().recorded {
                        tracing::debug!(job_id = %result.job_id, "Controller ignored exit report");
                    }
                    break;
                }
                Err(status)
                    if attempt < EXIT_REPORT_ATTEMPTS
                        && matches!(
                            status.code(),
                            tonic::Code::Unavailable
                                | tonic::Code::ResourceExhausted
                                | tonic::Code::DeadlineExceeded
                        ) =>
                {
                    tracing::debug!(job_id = %result.job_id, attempt, error = %status, "Retrying exit report");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(status) => {
                    tracing::warn!(job_id = %result.job_id, error = %status, "Exit report lost");
                    break;
                }
            }
        }
    }
}

/// Run a node agent: serve the agent protocol, register with the
/// controller, then heartbeat until `shutdown` is cancelled.
pub async fn run_agent(
    config: AgentConfig,
    authority: Arc<TokenAuthority>,
    shutdown: CancellationToken,
) -> Result<()> {
    let credentials = CredentialInjector::signing(
        node_subject(&config.node_id),
        authority.clone(),
        Duration::from_secs(config.token_lifetime_secs),
    );
    let channel = Endpoint::from_shared(config.controller_addr.clone())?
        .connect_timeout(Duration::from_secs(5))
        .connect_lazy();
    let mut client = NodeServiceClient::with_interceptor(channel, credentials);

    let (agent, exits) = NodeAgent::new(config.node_id.clone(), JobExecutor::new());

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(node_id = %config.node_id, addr = %listener.local_addr()?, "Starting node agent");
    let server = Server::builder()
        .add_service(AgentServiceServer::with_interceptor(
            agent.clone(),
            AuthInterceptor::new(authority),
        ))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });
    let server = tokio::spawn(server);

    let register = RegisterNodeRequest {
        node_id: config.node_id.clone(),
        capacity: Some(config.capacity.into()),
        address: config.advertised_address(),
    };
    let heartbeat_interval_ms = loop {
        match client.register_node(register.clone()).await {
            Ok(response) => {
                let interval = response.into_inner().heartbeat_interval_ms;
                tracing::info!(node_id = %config.node_id, capacity = %config.capacity, "Registered with controller");
                break if interval > 0 {
                    interval
                } else {
                    config.heartbeat_interval_ms
                };
            }
            Err(status) => {
                tracing::warn!(node_id = %config.node_id, error = %status, "Registration failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break config.heartbeat_interval_ms,
                    _ = tokio::time::sleep(REGISTER_RETRY) => {}
                }
            }
        }
    };

    let reporter = tokio::spawn(report_exits(client.clone(), config.node_id.clone(), exits));

    HeartbeatSender::new(config.node_id.clone(), config.capacity, heartbeat_interval_ms)
        .with_address(config.advertised_address())
        .run(client, shutdown.clone())
        .await;

    agent.stop_all().await;
    drop(agent);
    match server.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "Agent server task failed"),
    }
    // The server held the last agent clone, so the exit channel is closed
    // once it stops and the reporter drains what is left.
    if tokio::time::timeout(Duration::from_secs(5), reporter).await.is_err() {
        tracing::warn!(node_id = %config.node_id, "Gave up flushing exit reports");
    }
    tracing::info!(node_id = %config.node_id, "Node agent stopped");
    Ok(())
}
