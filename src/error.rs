use thiserror::Error;
use uuid::Uuid;

use crate::resources::ResourceVector;
use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum WlmError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsatisfiable request {requested}: no node has that much total capacity")]
    Unsatisfiable { requested: ResourceVector },

    #[error("Insufficient resources on node {node_id}")]
    InsufficientResources { node_id: String },

    #[error("Node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: String, reason: String },

    #[error("Dispatch to node {0} timed out")]
    DispatchTimeout(String),

    #[error("Launch rejected by node {node_id}: {reason}")]
    LaunchRejected { node_id: String, reason: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Allocation not found: {0}")]
    AllocationNotFound(Uuid),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Controller is busy, retry later")]
    Busy,

    #[error("Controller unavailable")]
    ControllerUnavailable,

    #[error("Accounting record for job {0} already exists")]
    DuplicateRecord(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WlmError {
    /// Transient dispatch failures count against the job's launch attempts
    /// instead of failing it outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WlmError::InsufficientResources { .. }
                | WlmError::NodeUnreachable { .. }
                | WlmError::DispatchTimeout(_)
        )
    }
}

impl From<WlmError> for tonic::Status {
    fn from(err: WlmError) -> Self {
        let message = err.to_string();
        match err {
            WlmError::Unauthorized(_) => tonic::Status::unauthenticated(message),
            WlmError::PermissionDenied(_) => tonic::Status::permission_denied(message),
            WlmError::Unsatisfiable { .. }
            | WlmError::InvalidJob(_)
            | WlmError::InvalidTransition { .. } => tonic::Status::failed_precondition(message),
            WlmError::NodeNotFound(_)
            | WlmError::JobNotFound(_)
            | WlmError::AllocationNotFound(_) => tonic::Status::not_found(message),
            WlmError::QueueFull | WlmError::Busy => tonic::Status::resource_exhausted(message),
            WlmError::ControllerUnavailable
            | WlmError::NodeUnreachable { .. }
            | WlmError::InsufficientResources { .. } => tonic::Status::unavailable(message),
            WlmError::DispatchTimeout(_) => tonic::Status::deadline_exceeded(message),
            WlmError::Grpc(status) => status,
            _ => tonic::Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, WlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsatisfiable_maps_to_failed_precondition() {
        let status: tonic::Status = WlmError::Unsatisfiable {
            requested: ResourceVector::new(8, 0, 0),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(status.message().contains("8 cpu"));
    }

    #[test]
    fn unauthorized_maps_to_unauthenticated() {
        let status: tonic::Status = WlmError::Unauthorized("expired".into()).into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn transient_errors() {
        assert!(WlmError::DispatchTimeout("n1".into()).is_transient());
        assert!(!WlmError::QueueFull.is_transient());
    }
}
