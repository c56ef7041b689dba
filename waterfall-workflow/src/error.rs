//! Error types for the workflow lifecycle manager and its collaborators.

use thiserror::Error;

/// Broad classes of failure, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller or persisted-state contract broken before any work began.
    Precondition,
    /// A collaborator failed while the operation was running.
    MidOperation,
    /// The driver lacks a capability the operation needs.
    CapabilityMissing,
    /// The request could not be routed to a backend or service.
    Routing,
    /// A referenced record does not exist.
    NotFound,
    /// Anything else.
    Internal,
}

/// Errors that can occur during workflow operations.
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    /// Job is in a state that does not allow the requested operation.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Volume is in a state that does not allow the requested operation.
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// The job was created by a different driver than the one configured here.
    #[error("Service mismatch for job {job_id}: job was created by {expected}, local driver is {actual}")]
    ServiceMismatch {
        job_id: String,
        expected: String,
        actual: String,
    },

    /// The driver does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// No host in the candidate list runs the required service.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// No driver registered for the backend.
    #[error("Backend not registered: {0}")]
    BackendNotRegistered(String),

    /// Host string carried no backend and no fallback was allowed.
    #[error("No backend specified")]
    NoBackendSpecified,

    /// An imported record is missing required fields.
    #[error("Imported record is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    /// An imported record belongs to a different job.
    #[error("Record id {actual} does not match job id {expected}")]
    IdentityMismatch {
        expected: String,
        actual: String,
    },

    /// A status string outside the closed status set.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// Job record was not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Volume record was not found.
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Backend driver reported an error.
    #[error("Driver error: {0}")]
    DriverFailed(String),

    /// Device attach or detach failed.
    #[error("Connector error: {0}")]
    ConnectorFailed(String),

    /// Volume-side collaborator reported an error.
    #[error("Volume service error: {0}")]
    VolumeServiceFailed(String),

    /// Quota ledger reported an error.
    #[error("Quota error: {0}")]
    QuotaFailed(String),

    /// Persistence store reported an error.
    #[error("Store error: {0}")]
    StoreFailed(String),

    /// RPC transport failure (including call timeouts).
    #[error("RPC error: {0}")]
    RpcFailed(String),

    /// The peer does not speak the requested protocol version.
    #[error("RPC version {requested} not supported (max {supported})")]
    VersionUnsupported {
        requested: String,
        supported: String,
    },

    /// Invalid configuration or registration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::InvalidJob(_)
            | WorkflowError::InvalidVolume(_)
            | WorkflowError::ServiceMismatch { .. }
            | WorkflowError::MissingFields(_)
            | WorkflowError::IdentityMismatch { .. }
            | WorkflowError::InvalidStatus(_) => ErrorKind::Precondition,
            WorkflowError::DriverFailed(_)
            | WorkflowError::ConnectorFailed(_)
            | WorkflowError::VolumeServiceFailed(_)
            | WorkflowError::QuotaFailed(_)
            | WorkflowError::StoreFailed(_) => ErrorKind::MidOperation,
            WorkflowError::UnsupportedOperation(_) => ErrorKind::CapabilityMissing,
            WorkflowError::ServiceNotFound(_)
            | WorkflowError::BackendNotRegistered(_)
            | WorkflowError::NoBackendSpecified
            | WorkflowError::RpcFailed(_)
            | WorkflowError::VersionUnsupported { .. } => ErrorKind::Routing,
            WorkflowError::JobNotFound(_) | WorkflowError::VolumeNotFound(_) => ErrorKind::NotFound,
            WorkflowError::InvalidConfig(_) | WorkflowError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the error reports a missing record.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(e: serde_json::Error) -> Self {
        WorkflowError::Internal(format!("Serialization error: {}", e))
    }
}

/// Result type alias for workflow operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(WorkflowError::InvalidJob("x".into()).kind(), ErrorKind::Precondition);
        assert_eq!(WorkflowError::DriverFailed("x".into()).kind(), ErrorKind::MidOperation);
        assert_eq!(
            WorkflowError::UnsupportedOperation("verify".into()).kind(),
            ErrorKind::CapabilityMissing
        );
        assert_eq!(WorkflowError::NoBackendSpecified.kind(), ErrorKind::Routing);
        assert!(WorkflowError::VolumeNotFound("v".into()).is_not_found());
    }

    #[test]
    fn test_missing_fields_message() {
        let err = WorkflowError::MissingFields(vec!["size".into(), "id".into()]);
        assert_eq!(err.to_string(), "Imported record is missing required fields: size, id");
    }
}
