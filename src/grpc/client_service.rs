use tonic::{Request, Response, Status};

use crate::accounting::RecordFilter;
use crate::auth::Principal;
use crate::cluster::{JobFilter, NodeStatus};
use crate::controller::ControllerHandle;
use crate::grpc::convert::{
    job_state_from_proto, job_state_to_proto, job_to_proto, node_to_proto, parse_job_id,
    record_to_proto,
};
use crate::grpc::interceptor::principal;
use crate::proto::workload_service_server::WorkloadService;
use crate::proto::{
    CancelJobRequest, CancelJobResponse, GetJobRequest, JobInfo, ListAccountingRequest,
    ListAccountingResponse, ListJobsRequest, ListJobsResponse, ListNodesRequest,
    ListNodesResponse, NodeAdminRequest, NodeInfo, SubmitJobRequest, SubmitJobResponse,
};
use crate::resources::ResourceVector;
use crate::scheduler::JobSpec;

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;

/// gRPC service for the client-facing API
pub struct ClientService {
    controller: ControllerHandle,
}

impl ClientService {
    pub fn new(controller: ControllerHandle) -> Self {
        Self { controller }
    }

    async fn node_info(&self, node_id: &str) -> Result<NodeInfo, Status> {
        let nodes = self.controller.list_nodes().await?;
        nodes
            .iter()
            .find(|n| n.node.id == node_id)
            .map(node_to_proto)
            .ok_or_else(|| Status::not_found(format!("Node not found: {node_id}")))
    }
}

fn submitting_user(principal: &Principal) -> Result<String, Status> {
    match principal {
        Principal::User { name, .. } => Ok(name.clone()),
        other => Err(Status::permission_denied(format!(
            "{} may not submit jobs",
            other.name()
        ))),
    }
}

#[tonic::async_trait]
impl WorkloadService for ClientService {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let owner = submitting_user(&principal(&request)?)?;
        let req = request.into_inner();

        if req.command.trim().is_empty() {
            return Err(Status::invalid_argument("Command cannot be empty"));
        }

        let resources: ResourceVector = req.resources.map(Into::into).unwrap_or_default();
        let mut spec = JobSpec::new(req.command, resources)
            .with_name(req.name)
            .with_priority(req.priority);
        if req.time_limit_secs > 0 {
            spec = spec.with_time_limit(req.time_limit_secs);
        }

        let job = self.controller.submit(&owner, spec).await?;
        Ok(Response::new(SubmitJobResponse {
            job_id: job.id.to_string(),
            submitted_at_ms: job.submitted_at.timestamp_millis(),
        }))
    }

    async fn get_job(&self, request: Request<GetJobRequest>) -> Result<Response<JobInfo>, Status> {
        principal(&request)?;
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let job = self.controller.get_job(job_id).await?;
        Ok(Response::new(job_to_proto(&job)))
    }

    async fn cancel_job(
        &self,
        request: Request<CancelJobRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let principal = principal(&request)?;
        let job_id = parse_job_id(&request.into_inner().job_id)?;
        let job = self.controller.cancel_job(principal, job_id).await?;
        Ok(Response::new(CancelJobResponse {
            job_id: job.id.to_string(),
            state: job_state_to_proto(job.state) as i32,
        }))
    }

    async fn list_jobs(
        &self,
        request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        principal(&request)?;
        let req = request.into_inner();

        // Parse pagination parameters
        let page_size = if req.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            req.page_size.min(MAX_PAGE_SIZE)
        } as usize;

        // Offset-based: the token is the starting index
        let offset: usize = if req.page_token.is_empty() {
            0
        } else {
            req.page_token
                .parse()
                .map_err(|_| Status::invalid_argument("Invalid page token"))?
        };

        let filter = JobFilter {
            state: job_state_from_proto(req.state_filter),
            owner: (!req.owner_filter.is_empty()).then_some(req.owner_filter),
        };
        let all_jobs = self.controller.list_jobs(filter).await?;
        let total_count = all_jobs.len() as u32;

        let jobs: Vec<JobInfo> = all_jobs
            .iter()
            .skip(offset)
            .take(page_size)
            .map(job_to_proto)
            .collect();

        let next_offset = offset + jobs.len();
        let next_page_token = if next_offset < total_count as usize {
            next_offset.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListJobsResponse {
            jobs,
            next_page_token,
            total_count,
        }))
    }

    async fn list_nodes(
        &self,
        request: Request<ListNodesRequest>,
    ) -> Result<Response<ListNodesResponse>, Status> {
        principal(&request)?;
        let nodes = self.controller.list_nodes().await?;
        Ok(Response::new(ListNodesResponse {
            nodes: nodes.iter().map(node_to_proto).collect(),
        }))
    }

    async fn drain_node(
        &self,
        request: Request<NodeAdminRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        principal(&request)?.require_admin()?;
        let node_id = request.into_inner().node_id;
        self.controller.drain_node(&node_id).await?;
        Ok(Response::new(self.node_info(&node_id).await?))
    }

    async fn resume_node(
        &self,
        request: Request<NodeAdminRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        principal(&request)?.require_admin()?;
        let node_id = request.into_inner().node_id;
        self.controller.resume_node(&node_id).await?;
        Ok(Response::new(self.node_info(&node_id).await?))
    }

    async fn remove_node(
        &self,
        request: Request<NodeAdminRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        principal(&request)?.require_admin()?;
        let node_id = request.into_inner().node_id;
        let node = self.controller.remove_node(&node_id).await?;
        Ok(Response::new(node_to_proto(&NodeStatus {
            node,
            free: ResourceVector::ZERO,
            allocated: ResourceVector::ZERO,
            active_jobs: 0,
        })))
    }

    async fn list_accounting(
        &self,
        request: Request<ListAccountingRequest>,
    ) -> Result<Response<ListAccountingResponse>, Status> {
        let caller = principal(&request)?;
        let req = request.into_inner();

        // Non-admins only see their own records.
        let owner = match &caller {
            Principal::User { name, admin: false } => {
                if !req.owner_filter.is_empty() && req.owner_filter != *name {
                    return Err(Status::permission_denied(
                        "only administrators may read other users' records",
                    ));
                }
                Some(name.clone())
            }
            _ => (!req.owner_filter.is_empty()).then_some(req.owner_filter),
        };
        let filter = RecordFilter {
            owner,
            state: job_state_from_proto(req.state_filter),
            limit: (req.limit > 0).then_some(req.limit as usize),
        };
        let records = self.controller.history(filter).await?;
        Ok(Response::new(ListAccountingResponse {
            records: records.iter().map(record_to_proto).collect(),
        }))
    }
}
