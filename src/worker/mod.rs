//! Node agent: the daemon each compute node runs.
//!
//! - **Registration and heartbeat**: announces the node's capacity to the
//!   controller and keeps it `Up`
//! - **Job execution**: runs launched commands as `sh -c <command>` with a
//!   wall-time limit
//! - **Exit reporting**: tells the controller how each job ended
//!
//! # Components
//!
//! - [`JobExecutor`]: executes one command and returns an [`ExecutionResult`]
//! - [`NodeAgent`]: the `AgentService` the controller calls to launch and
//!   terminate jobs
//! - [`HeartbeatSender`]: periodic keep-alive to the controller
//!
//! Commands run directly via the shell without sandboxing.

pub mod agent;
pub mod executor;
pub mod heartbeat;

use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::grpc::interceptor::CredentialInjector;
use crate::proto::node_service_client::NodeServiceClient;

pub use agent::{run_agent, NodeAgent};
pub use executor::{ExecutionResult, JobExecutor};
pub use heartbeat::HeartbeatSender;

/// Authenticated client for the controller's node protocol.
pub type ControllerClient = NodeServiceClient<InterceptedService<Channel, CredentialInjector>>;
