use chrono::Utc;
use tonic::{Request, Response, Status};

use crate::controller::{ControllerHandle, JobExit};
use crate::grpc::convert::{
    job_state_from_proto, node_state_from_proto, node_state_to_proto, parse_job_id,
    timestamp_from_ms,
};
use crate::grpc::interceptor::principal;
use crate::proto::node_service_server::NodeService;
use crate::proto::{
    HeartbeatRequest, HeartbeatResponse, JobExitAck, JobExitReport, RegisterNodeRequest,
    RegisterNodeResponse,
};
use crate::registry::Heartbeat;

/// gRPC service called by node agents.
pub struct NodeProtocolService {
    controller: ControllerHandle,
    heartbeat_interval_ms: u64,
}

impl NodeProtocolService {
    pub fn new(controller: ControllerHandle, heartbeat_interval_ms: u64) -> Self {
        Self {
            controller,
            heartbeat_interval_ms,
        }
    }
}

#[tonic::async_trait]
impl NodeService for NodeProtocolService {
    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let caller = principal(&request)?;
        let req = request.into_inner();
        caller.require_node(&req.node_id)?;

        let capacity = req
            .capacity
            .map(Into::into)
            .ok_or_else(|| Status::invalid_argument("capacity is required"))?;
        let address = (!req.address.is_empty()).then_some(req.address);

        let node = self
            .controller
            .register_node(&req.node_id, capacity, address)
            .await?;
        Ok(Response::new(RegisterNodeResponse {
            state: node_state_to_proto(node.state) as i32,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let caller = principal(&request)?;
        let req = request.into_inner();
        caller.require_node(&req.node_id)?;

        let beat = Heartbeat {
            node_id: req.node_id,
            observed_state: node_state_from_proto(req.observed_state),
            capacity: req.capacity.map(Into::into),
            address: (!req.address.is_empty()).then_some(req.address),
            sent_at: timestamp_from_ms(req.sent_at_ms, Utc::now()),
        };
        let reply = self.controller.heartbeat(beat).await?;
        Ok(Response::new(HeartbeatResponse {
            accepted: reply.accepted,
            state: node_state_to_proto(reply.state) as i32,
        }))
    }

    async fn report_job_exit(
        &self,
        request: Request<JobExitReport>,
    ) -> Result<Response<JobExitAck>, Status> {
        let caller = principal(&request)?;
        let req = request.into_inner();
        caller.require_node(&req.node_id)?;

        let state = job_state_from_proto(req.state)
            .ok_or_else(|| Status::invalid_argument("exit report needs a job state"))?;
        let report = JobExit {
            job_id: parse_job_id(&req.job_id)?,
            node_id: req.node_id,
            state,
            exit_code: req.exit_code,
            error: (!req.error.is_empty()).then_some(req.error),
            ended_at: timestamp_from_ms(req.ended_at_ms, Utc::now()),
        };
        let recorded = self.controller.report_exit(report).await?;
        Ok(Response::new(JobExitAck { recorded }))
    }
}
