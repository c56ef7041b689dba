//! Server side of the workflow RPC API.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::message::{RpcEnvelope, WorkflowReply, WorkflowRequest};
use super::transport::RpcEndpoint;
use super::version::RpcVersion;
use crate::error::{Result, WorkflowError};
use crate::manager::WorkflowManager;

/// Routes versioned requests to a workflow manager.
pub struct WorkflowDispatcher {
    manager: Arc<WorkflowManager>,
    /// Highest version of each major this server speaks
    supported: Vec<RpcVersion>,
}

impl WorkflowDispatcher {
    /// A dispatcher speaking the current version only.
    pub fn new(manager: Arc<WorkflowManager>) -> Self {
        Self::with_versions(manager, vec![RpcVersion::CURRENT])
    }

    /// A dispatcher that also accepts 1.x messages from peers that have
    /// not been upgraded yet.
    pub fn with_legacy(manager: Arc<WorkflowManager>) -> Self {
        Self::with_versions(manager, vec![RpcVersion::CURRENT, RpcVersion::V1_3])
    }

    /// A dispatcher speaking exactly `supported`.
    pub fn with_versions(manager: Arc<WorkflowManager>, supported: Vec<RpcVersion>) -> Self {
        Self { manager, supported }
    }

    /// Manager requests are dispatched to.
    pub fn manager(&self) -> &Arc<WorkflowManager> {
        &self.manager
    }

    fn check_version(&self, requested: RpcVersion) -> Result<()> {
        if self.supported.iter().any(|v| v.can_accept(requested)) {
            return Ok(());
        }
        Err(WorkflowError::VersionUnsupported {
            requested: requested.to_string(),
            supported: self.max_version().to_string(),
        })
    }
}

#[async_trait]
impl RpcEndpoint for WorkflowDispatcher {
    fn max_version(&self) -> RpcVersion {
        self.supported.iter().copied().max().unwrap_or(RpcVersion::CURRENT)
    }

    #[instrument(skip(self, envelope), fields(method = envelope.request.method(), version = %envelope.version))]
    async fn dispatch(&self, envelope: RpcEnvelope) -> Result<WorkflowReply> {
        self.check_version(envelope.version)?;
        let ctx = envelope.context;
        debug!(request_id = %ctx.request_id(), "Dispatching workflow request");

        match envelope.request {
            WorkflowRequest::CreateJob { job } => {
                self.manager.create_job(&ctx, job).await?;
                Ok(WorkflowReply::Ack)
            }
            WorkflowRequest::RestoreJob { job, volume_id } => {
                self.manager.restore_job(&ctx, job, &volume_id).await?;
                Ok(WorkflowReply::Ack)
            }
            WorkflowRequest::DeleteJob { job } => {
                self.manager.delete_job(&ctx, job).await?;
                Ok(WorkflowReply::Ack)
            }
            WorkflowRequest::ExportRecord { job } => {
                let record = self.manager.export_record(&ctx, job).await?;
                Ok(WorkflowReply::Record(record))
            }
            WorkflowRequest::ImportRecord {
                job,
                service,
                url,
                candidate_hosts,
            } => {
                self.manager
                    .import_record(&ctx, job, &service, &url, candidate_hosts)
                    .await?;
                Ok(WorkflowReply::Ack)
            }
            WorkflowRequest::ResetStatus { job, status } => {
                self.manager.reset_status(&ctx, job, status).await?;
                Ok(WorkflowReply::Ack)
            }
            WorkflowRequest::CheckSupportToForceDelete => Ok(WorkflowReply::Supported(
                self.manager.check_support_to_force_delete(),
            )),
        }
    }
}
