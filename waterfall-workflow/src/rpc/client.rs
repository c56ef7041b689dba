//! Client side of the workflow RPC API.

use std::sync::Arc;

use tracing::debug;

use super::message::{RpcEnvelope, WorkflowRequest};
use super::transport::RpcChannel;
use super::version::RpcVersion;
use crate::error::{Result, WorkflowError};
use crate::types::{ExportedRecord, Job, JobStatus, RequestContext};

/// Version-negotiating proxy for workflow managers on other nodes.
#[derive(Clone)]
pub struct WorkflowRpcClient {
    channel: Arc<dyn RpcChannel>,
}

impl WorkflowRpcClient {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }

    /// `current` if the channel can send it to `server`, else `legacy`.
    pub fn compat_version(&self, server: &str, current: RpcVersion, legacy: RpcVersion) -> RpcVersion {
        if self.channel.can_send_version(server, current) {
            current
        } else {
            legacy
        }
    }

    fn prepare(&self, server: &str, ctx: &RequestContext, request: WorkflowRequest) -> RpcEnvelope {
        let version = self.compat_version(server, RpcVersion::CURRENT, RpcVersion::LEGACY);
        debug!(
            server = %server,
            method = request.method(),
            version = %version,
            request_id = %ctx.request_id(),
            "Preparing workflow RPC"
        );
        RpcEnvelope::new(version, ctx, request)
    }

    fn server_of(job: &Job) -> Result<&str> {
        job.host.as_deref().ok_or_else(|| {
            WorkflowError::RpcFailed(format!("job {} has no host to route to", job.id))
        })
    }

    pub async fn create_job(&self, ctx: &RequestContext, job: &Job) -> Result<()> {
        let server = Self::server_of(job)?;
        let envelope = self.prepare(server, ctx, WorkflowRequest::CreateJob { job: job.clone() });
        self.channel.cast(server, envelope).await
    }

    /// Restores run on the host of the target volume.
    pub async fn restore_job(
        &self,
        ctx: &RequestContext,
        volume_host: &str,
        job: &Job,
        volume_id: &str,
    ) -> Result<()> {
        let envelope = self.prepare(
            volume_host,
            ctx,
            WorkflowRequest::RestoreJob {
                job: job.clone(),
                volume_id: volume_id.to_string(),
            },
        );
        self.channel.cast(volume_host, envelope).await
    }

    pub async fn delete_job(&self, ctx: &RequestContext, job: &Job) -> Result<()> {
        let server = Self::server_of(job)?;
        let envelope = self.prepare(server, ctx, WorkflowRequest::DeleteJob { job: job.clone() });
        self.channel.cast(server, envelope).await
    }

    pub async fn export_record(&self, ctx: &RequestContext, job: &Job) -> Result<ExportedRecord> {
        let server = Self::server_of(job)?;
        let envelope = self.prepare(server, ctx, WorkflowRequest::ExportRecord { job: job.clone() });
        self.channel.call(server, envelope).await?.into_record()
    }

    pub async fn import_record(
        &self,
        ctx: &RequestContext,
        host: &str,
        job: &Job,
        service: &str,
        url: &str,
        candidate_hosts: Vec<String>,
    ) -> Result<()> {
        let envelope = self.prepare(
            host,
            ctx,
            WorkflowRequest::ImportRecord {
                job: job.clone(),
                service: service.to_string(),
                url: url.to_string(),
                candidate_hosts,
            },
        );
        self.channel.cast(host, envelope).await
    }

    pub async fn reset_status(&self, ctx: &RequestContext, job: &Job, status: JobStatus) -> Result<()> {
        let server = Self::server_of(job)?;
        let envelope = self.prepare(
            server,
            ctx,
            WorkflowRequest::ResetStatus {
                job: job.clone(),
                status,
            },
        );
        self.channel.cast(server, envelope).await
    }

    pub async fn check_support_to_force_delete(&self, ctx: &RequestContext, host: &str) -> Result<bool> {
        let envelope = self.prepare(host, ctx, WorkflowRequest::CheckSupportToForceDelete);
        self.channel.call(host, envelope).await?.into_supported()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::LocalTransport;

    #[test]
    fn test_compat_version_falls_back_under_cap() {
        let client = WorkflowRpcClient::new(Arc::new(LocalTransport::new()));
        assert_eq!(
            client.compat_version("node1@simple", RpcVersion::CURRENT, RpcVersion::LEGACY),
            RpcVersion::V2_0
        );

        let capped = WorkflowRpcClient::new(Arc::new(
            LocalTransport::new().with_version_cap(RpcVersion::V1_3),
        ));
        assert_eq!(
            capped.compat_version("node1@simple", RpcVersion::CURRENT, RpcVersion::LEGACY),
            RpcVersion::V1_1
        );
    }

    #[tokio::test]
    async fn test_job_without_host_is_not_sent() {
        let client = WorkflowRpcClient::new(Arc::new(LocalTransport::new()));
        let job = Job::new("vol-1");
        let err = client.delete_job(&RequestContext::admin(), &job).await.unwrap_err();
        assert!(matches!(err, WorkflowError::RpcFailed(_)));
    }
}
