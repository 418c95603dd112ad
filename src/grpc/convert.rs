//! Conversions between protobuf messages and domain types.

use chrono::{DateTime, Utc};
use tonic::Status;
use uuid::Uuid;

use crate::accounting::JobRecord;
use crate::cluster::NodeStatus;
use crate::proto;
use crate::registry::NodeState;
use crate::resources::ResourceVector;
use crate::scheduler::{Job, JobState};

impl From<ResourceVector> for proto::Resources {
    fn from(r: ResourceVector) -> Self {
        Self {
            cpus: r.cpus,
            memory_mb: r.memory_mb,
            gpus: r.gpus,
        }
    }
}

impl From<proto::Resources> for ResourceVector {
    fn from(r: proto::Resources) -> Self {
        ResourceVector::new(r.cpus, r.memory_mb, r.gpus)
    }
}

pub fn job_state_to_proto(state: JobState) -> proto::JobState {
    match state {
        JobState::Pending => proto::JobState::Pending,
        JobState::Scheduled => proto::JobState::Scheduled,
        JobState::Running => proto::JobState::Running,
        JobState::Completed => proto::JobState::Completed,
        JobState::Failed => proto::JobState::Failed,
        JobState::Cancelled => proto::JobState::Cancelled,
    }
}

/// `None` for the unspecified value or an unknown number.
pub fn job_state_from_proto(value: i32) -> Option<JobState> {
    match proto::JobState::try_from(value).ok()? {
        proto::JobState::Unspecified => None,
        proto::JobState::Pending => Some(JobState::Pending),
        proto::JobState::Scheduled => Some(JobState::Scheduled),
        proto::JobState::Running => Some(JobState::Running),
        proto::JobState::Completed => Some(JobState::Completed),
        proto::JobState::Failed => Some(JobState::Failed),
        proto::JobState::Cancelled => Some(JobState::Cancelled),
    }
}

pub fn node_state_to_proto(state: NodeState) -> proto::NodeState {
    match state {
        NodeState::Up => proto::NodeState::Up,
        NodeState::Down => proto::NodeState::Down,
        NodeState::Draining => proto::NodeState::Draining,
        NodeState::Unknown => proto::NodeState::Unknown,
    }
}

/// Unspecified and unknown numbers read as [`NodeState::Unknown`].
pub fn node_state_from_proto(value: i32) -> NodeState {
    match proto::NodeState::try_from(value) {
        Ok(proto::NodeState::Up) => NodeState::Up,
        Ok(proto::NodeState::Down) => NodeState::Down,
        Ok(proto::NodeState::Draining) => NodeState::Draining,
        _ => NodeState::Unknown,
    }
}

pub fn job_to_proto(job: &Job) -> proto::JobInfo {
    proto::JobInfo {
        job_id: job.id.to_string(),
        name: job.name.clone(),
        owner: job.owner.clone(),
        command: job.command.clone(),
        state: job_state_to_proto(job.state) as i32,
        resources: Some(job.resources.into()),
        priority: job.priority,
        time_limit_secs: job.time_limit_secs,
        node_id: job.assigned_node.clone().unwrap_or_default(),
        submitted_at_ms: job.submitted_at.timestamp_millis(),
        started_at_ms: job.started_at.map(|dt| dt.timestamp_millis()),
        ended_at_ms: job.ended_at.map(|dt| dt.timestamp_millis()),
        exit_code: job.exit_code,
        reason: job.reason.clone().unwrap_or_default(),
        launch_attempts: job.launch_attempts,
    }
}

pub fn node_to_proto(status: &NodeStatus) -> proto::NodeInfo {
    let node = &status.node;
    proto::NodeInfo {
        node_id: node.id.clone(),
        state: node_state_to_proto(node.state) as i32,
        capacity: Some(node.capacity.into()),
        free: Some(status.free.into()),
        address: node.address.clone().unwrap_or_default(),
        last_heartbeat_ms: node.last_heartbeat.map(|dt| dt.timestamp_millis()),
        drained: node.drained,
        reason: node.reason.clone().unwrap_or_default(),
    }
}

pub fn record_to_proto(record: &JobRecord) -> proto::AccountingRecord {
    proto::AccountingRecord {
        job: Some(job_to_proto(&record.job)),
        elapsed_secs: record.usage.elapsed_secs,
        cpu_seconds: record.usage.cpu_seconds,
        gpu_seconds: record.usage.gpu_seconds,
        recorded_at_ms: record.recorded_at.timestamp_millis(),
    }
}

pub fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(raw).map_err(|_| Status::invalid_argument("Invalid job ID"))
}

/// Milliseconds since the epoch; zero or out-of-range values read as `now`.
pub fn timestamp_from_ms(ms: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    if ms <= 0 {
        return now;
    }
    DateTime::from_timestamp_millis(ms).unwrap_or(now)
}
