//! Volume-side collaborator interface.
//!
//! The volume service owns volumes and snapshots. The workflow manager asks
//! it which device to back up, for connections to that device, and to
//! delete scratch resources it created.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connector::{ConnectionInfo, ConnectorProperties};
use crate::error::Result;
use crate::types::{Job, RequestContext};

/// The device a backup reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDevice {
    /// Volume or snapshot ID to attach
    pub device_id: String,
    /// Whether `device_id` names a snapshot
    pub is_snapshot: bool,
    /// Whether the transport is already encrypted end to end
    pub secure_enabled: bool,
    /// Scratch volume the volume side created for this backup
    pub temp_volume_id: Option<String>,
    /// Scratch snapshot the volume side created for this backup
    pub temp_snapshot_id: Option<String>,
}

impl BackupDevice {
    /// A plain volume device with no scratch resources.
    pub fn volume(volume_id: impl Into<String>) -> Self {
        Self {
            device_id: volume_id.into(),
            is_snapshot: false,
            secure_enabled: false,
            temp_volume_id: None,
            temp_snapshot_id: None,
        }
    }

    /// A snapshot device with no scratch resources.
    pub fn snapshot(snapshot_id: impl Into<String>) -> Self {
        Self {
            is_snapshot: true,
            ..Self::volume(snapshot_id)
        }
    }
}

/// Volume service trait.
#[async_trait]
pub trait VolumeService: Send + Sync {
    /// Device to back up for `job`, creating scratch resources if needed.
    async fn get_backup_device(&self, ctx: &RequestContext, job: &Job) -> Result<BackupDevice>;

    /// Export a volume to this host.
    async fn initialize_connection(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        props: &ConnectorProperties,
    ) -> Result<ConnectionInfo>;

    /// Export a snapshot to this host.
    async fn initialize_connection_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        props: &ConnectorProperties,
    ) -> Result<ConnectionInfo>;

    /// Tear down a volume export to this host.
    async fn terminate_connection(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        props: &ConnectorProperties,
        force: bool,
    ) -> Result<()>;

    /// Tear down a snapshot export to this host.
    async fn terminate_connection_snapshot(
        &self,
        ctx: &RequestContext,
        snapshot_id: &str,
        props: &ConnectorProperties,
        force: bool,
    ) -> Result<()>;

    /// Remove the target created for a volume export.
    async fn remove_export(&self, ctx: &RequestContext, volume_id: &str) -> Result<()>;

    /// Remove the target created for a snapshot export.
    async fn remove_export_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()>;

    /// Detach one attachment of a volume.
    async fn detach_volume(
        &self,
        ctx: &RequestContext,
        volume_id: &str,
        attachment_id: &str,
    ) -> Result<()>;

    /// Delete a scratch volume. `VolumeNotFound` if it is already gone.
    async fn delete_volume(&self, ctx: &RequestContext, volume_id: &str) -> Result<()>;

    /// Delete a scratch snapshot. `VolumeNotFound` if it is already gone.
    async fn delete_snapshot(&self, ctx: &RequestContext, snapshot_id: &str) -> Result<()>;
}
