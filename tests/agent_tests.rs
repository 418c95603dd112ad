//! Node agent tests: the agent service in isolation, then a controller and
//! a real agent talking over loopback gRPC.


use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::{Code, Request};
use uuid::Uuid;

use test_harness::{test_authority, test_config, user, wait_for};
use wlm_lite::accounting::AccountingStore;
use wlm_lite::auth::{Principal, CONTROLLER_SUBJECT};
use wlm_lite::config::AgentConfig;
use wlm_lite::controller::Controller;
use wlm_lite::dispatch::GrpcNodeClient;
use wlm_lite::grpc::interceptor::CredentialInjector;
use wlm_lite::grpc::GrpcServer;
use wlm_lite::proto::agent_service_server::AgentService;
use wlm_lite::proto::workload_service_client::WorkloadServiceClient;
use wlm_lite::proto::{
    self, GetJobRequest, LaunchJobRequest, ListNodesRequest, Resources, SubmitJobRequest,
    TerminateJobRequest,
};
use wlm_lite::resources::ResourceVector;
use wlm_lite::scheduler::JobState;
use wlm_lite::worker::{run_agent, JobExecutor, NodeAgent};

fn launch(job_id: Uuid, command: &str, limit_secs: u64) -> Request<LaunchJobRequest> {
    let mut request = Request::new(LaunchJobRequest {
        job_id: job_id.to_string(),
        owner: "alice".to_string(),
        command: command.to_string(),
        resources: None,
        time_limit_secs: limit_secs,
    });
    request.extensions_mut().insert(Principal::Controller);
    request
}

fn terminate(job_id: Uuid) -> Request<TerminateJobRequest> {
    let mut request = Request::new(TerminateJobRequest {
        job_id: job_id.to_string(),
    });
    request.extensions_mut().insert(Principal::Controller);
    request
}

#[tokio::test]
async fn test_launch_runs_job_and_queues_exit() {
    let (agent, mut exits) = NodeAgent::new("n1", JobExecutor::new());
    let job_id = Uuid::new_v4();

    let response = agent
        .launch_job(launch(job_id, "echo hi", 30))
        .await
        .unwrap()
        .into_inner();
    assert!(response.accepted);

    let result = tokio::time::timeout(Duration::from_secs(5), exits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.job_id, job_id);
    assert_eq!(result.state, JobState::Completed);
    assert_eq!(result.output.as_deref(), Some("hi\n"));
    assert!(agent.running_jobs().await.is_empty());

    let report = wlm_lite::worker::agent::exit_report(agent.node_id(), &result);
    assert_eq!(report.node_id, "n1");
    assert_eq!(report.state, proto::JobState::Completed as i32);
    assert_eq!(report.exit_code, Some(0));
}

#[tokio::test]
async fn test_duplicate_launch_is_accepted_once() {
    let (agent, _exits) = NodeAgent::new("n1", JobExecutor::new());
    let job_id = Uuid::new_v4();

    let first = agent.launch_job(launch(job_id, "sleep 30", 60)).await.unwrap();
    let second = agent.launch_job(launch(job_id, "sleep 30", 60)).await.unwrap();
    assert!(first.into_inner().accepted);
    let second = second.into_inner();
    assert!(second.accepted);
    assert_eq!(second.message, "already running");
    assert_eq!(agent.running_jobs().await, vec![job_id]);

    agent.stop_all().await;
}

#[tokio::test]
async fn test_terminate_kills_running_job() {
    let (agent, mut exits) = NodeAgent::new("n1", JobExecutor::new());
    let job_id = Uuid::new_v4();
    agent.launch_job(launch(job_id, "sleep 30", 60)).await.unwrap();

    let response = agent.terminate_job(terminate(job_id)).await.unwrap().into_inner();
    assert!(response.was_running);

    let result = tokio::time::timeout(Duration::from_secs(5), exits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.state, JobState::Cancelled);

    let again = agent.terminate_job(terminate(job_id)).await.unwrap().into_inner();
    assert!(!again.was_running);
}

#[tokio::test]
async fn test_agent_rejects_bad_launches() {
    let (agent, _exits) = NodeAgent::new("n1", JobExecutor::new());

    let response = agent
        .launch_job(launch(Uuid::new_v4(), "   ", 60))
        .await
        .unwrap()
        .into_inner();
    assert!(!response.accepted);

    let mut from_user = launch(Uuid::new_v4(), "true", 60);
    from_user.extensions_mut().insert(user("alice"));
    let err = agent.launch_job(from_user).await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = agent
        .terminate_job(Request::new(TerminateJobRequest {
            job_id: Uuid::new_v4().to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_job_runs_end_to_end_on_agent() {
    let authority = test_authority();
    let shutdown = CancellationToken::new();

    let mut config = test_config();
    config.dispatch.launch_timeout_ms = 3000;
    let node_client = Arc::new(GrpcNodeClient::new(
        CredentialInjector::signing(CONTROLLER_SUBJECT, authority.clone(), Duration::from_secs(60)),
        Duration::from_secs(2),
    ));
    let (controller, handle) = Controller::new(config, node_client, AccountingStore::in_memory());
    tokio::spawn(controller.run(shutdown.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let controller_addr = listener.local_addr().unwrap();
    tokio::spawn(
        GrpcServer::new(controller_addr, handle, authority.clone(), 100).serve(listener, shutdown.clone()),
    );

    let agent_addr = format!("127.0.0.1:{}", free_port().await).parse().unwrap();
    let mut agent_config = AgentConfig::new("n1", agent_addr, ResourceVector::new(2, 512, 0));
    agent_config.controller_addr = format!("http://{controller_addr}");
    let agent = tokio::spawn(run_agent(agent_config, authority.clone(), shutdown.clone()));

    let channel = Endpoint::from_shared(format!("http://{controller_addr}"))
        .unwrap()
        .connect_lazy();
    let mut client = WorkloadServiceClient::with_interceptor(
        channel,
        CredentialInjector::signing("alice", authority, Duration::from_secs(60)),
    );

    let registered = wait_for(
        || {
            let mut client = client.clone();
            async move {
                client
                    .list_nodes(ListNodesRequest {})
                    .await
                    .map(|r| r.into_inner().nodes.len() == 1)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(10),
        Duration::from_millis(50),
    )
    .await;
    assert!(registered, "agent should register with the controller");

    let job_id = client
        .submit_job(SubmitJobRequest {
            name: "e2e".to_string(),
            command: "echo hi".to_string(),
            resources: Some(Resources {
                cpus: 1,
                memory_mb: 128,
                gpus: 0,
            }),
            priority: 0,
            time_limit_secs: 30,
        })
        .await
        .unwrap()
        .into_inner()
        .job_id;

    let completed = wait_for(
        || {
            let mut client = client.clone();
            let job_id = job_id.clone();
            async move {
                client
                    .get_job(GetJobRequest { job_id })
                    .await
                    .map(|r| r.into_inner().state == proto::JobState::Completed as i32)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(10),
        Duration::from_millis(50),
    )
    .await;
    assert!(completed, "job should complete on the agent");

    let job = client
        .get_job(GetJobRequest { job_id })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(job.node_id, "n1");
    assert_eq!(job.exit_code, Some(0));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), agent)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
