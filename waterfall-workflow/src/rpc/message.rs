//! Workflow RPC messages.

use serde::{Deserialize, Serialize};

use super::version::RpcVersion;
use crate::error::{Result, WorkflowError};
use crate::types::{ExportedRecord, Job, JobStatus, RequestContext};

/// A request to a workflow manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum WorkflowRequest {
    CreateJob {
        job: Job,
    },
    RestoreJob {
        job: Job,
        volume_id: String,
    },
    DeleteJob {
        job: Job,
    },
    ExportRecord {
        job: Job,
    },
    ImportRecord {
        job: Job,
        service: String,
        url: String,
        candidate_hosts: Vec<String>,
    },
    ResetStatus {
        job: Job,
        status: JobStatus,
    },
    CheckSupportToForceDelete,
}

impl WorkflowRequest {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            WorkflowRequest::CreateJob { .. } => "create_job",
            WorkflowRequest::RestoreJob { .. } => "restore_job",
            WorkflowRequest::DeleteJob { .. } => "delete_job",
            WorkflowRequest::ExportRecord { .. } => "export_record",
            WorkflowRequest::ImportRecord { .. } => "import_record",
            WorkflowRequest::ResetStatus { .. } => "reset_status",
            WorkflowRequest::CheckSupportToForceDelete => "check_support_to_force_delete",
        }
    }
}

/// Reply to a workflow request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WorkflowReply {
    Ack,
    Record(ExportedRecord),
    Supported(bool),
}

impl WorkflowReply {
    pub fn into_record(self) -> Result<ExportedRecord> {
        match self {
            WorkflowReply::Record(record) => Ok(record),
            other => Err(WorkflowError::RpcFailed(format!(
                "expected an exported record, got {:?}",
                other
            ))),
        }
    }

    pub fn into_supported(self) -> Result<bool> {
        match self {
            WorkflowReply::Supported(supported) => Ok(supported),
            other => Err(WorkflowError::RpcFailed(format!(
                "expected a capability flag, got {:?}",
                other
            ))),
        }
    }
}

/// A versioned request with its context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub version: RpcVersion,
    pub context: RequestContext,
    pub request: WorkflowRequest,
}

impl RpcEnvelope {
    /// Wrap `request` at `version`, dropping context fields the version
    /// does not carry.
    pub fn new(version: RpcVersion, ctx: &RequestContext, request: WorkflowRequest) -> Self {
        let mut context = ctx.clone();
        if !version.carries_request_id() {
            context.request_id = None;
        }
        Self {
            version,
            context,
            request,
        }
    }
}
