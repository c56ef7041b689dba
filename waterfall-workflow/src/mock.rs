//! Mock collaborators for testing and development.
//!
//! These keep everything in memory and record what was asked of them, so
//! the manager can be exercised end to end without a storage backend:
//! - [`MockDriver`]: backup data kept per job, with failure injection
//! - [`MockVolumeService`]: hands out a scratch device file and scratch resources
//! - [`MockConnector`]: "attaches" the scratch file and counts disconnects

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::connector::{AttachedDevice, ConnectionInfo, ConnectorProperties, DeviceConnector};
use crate::driver::{BackendDriver, DeviceIo};
use crate::error::{Result, WorkflowError};
use crate::types::{Job, RequestContext};
use crate::volume::{BackupDevice, VolumeService};

/// Name the mock driver records as `Job::service`.
pub const MOCK_DRIVER_NAME: &str = "waterfall.workflow.drivers.mock.MockDriver";

/// Protocol name of the mock connector.
pub const MOCK_PROTOCOL: &str = "mock";

fn poisoned<T>(_: T) -> WorkflowError {
    WorkflowError::Internal("Lock poisoned".to_string())
}

// =============================================================================
// Driver
// =============================================================================

/// Driver operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    Backup,
    Restore,
    Delete,
    Export,
    Import,
    Verify,
}

/// In-memory backend driver.
pub struct MockDriver {
    name: String,
    backups: RwLock<HashMap<String, Vec<u8>>>,
    failures: RwLock<HashSet<DriverOp>>,
    verify_supported: AtomicBool,
    force_delete: AtomicBool,
    calls: RwLock<HashMap<DriverOp, usize>>,
}

impl MockDriver {
    /// Create a mock driver.
    pub fn new() -> Self {
        info!("Creating mock workflow driver");
        Self {
            name: MOCK_DRIVER_NAME.to_string(),
            backups: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashSet::new()),
            verify_supported: AtomicBool::new(false),
            force_delete: AtomicBool::new(true),
            calls: RwLock::new(HashMap::new()),
        }
    }

    /// Record a different driver name, to stand in for another service.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Advertise and implement `verify`.
    pub fn with_verify(self, supported: bool) -> Self {
        self.verify_supported.store(supported, Ordering::SeqCst);
        self
    }

    /// Make `op` fail until cleared.
    pub fn fail_on(&self, op: DriverOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(op);
        }
    }

    /// Clear all injected failures.
    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.write() {
            failures.clear();
        }
    }

    /// Number of times `op` was invoked.
    pub fn call_count(&self, op: DriverOp) -> usize {
        self.calls
            .read()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Stored data for a job.
    pub fn backup_data(&self, job_id: &str) -> Option<Vec<u8>> {
        self.backups.read().ok()?.get(job_id).cloned()
    }

    /// Store data for a job directly.
    pub fn seed_backup(&self, job_id: &str, data: Vec<u8>) {
        if let Ok(mut backups) = self.backups.write() {
            backups.insert(job_id.to_string(), data);
        }
    }

    fn enter(&self, op: DriverOp) -> Result<()> {
        *self.calls.write().map_err(poisoned)?.entry(op).or_insert(0) += 1;
        if self.failures.read().map_err(poisoned)?.contains(&op) {
            return Err(WorkflowError::DriverFailed(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, job, device), fields(job_id = %job.id))]
    async fn backup(&self, job: &Job, device: &mut dyn DeviceIo) -> Result<()> {
        self.enter(DriverOp::Backup)?;
        let mut data = Vec::new();
        device
            .read_to_end(&mut data)
            .await
            .map_err(|e| WorkflowError::DriverFailed(format!("read failed: {}", e)))?;
        debug!(bytes = data.len(), "Mock backup taken");
        self.backups.write().map_err(poisoned)?.insert(job.id.clone(), data);
        Ok(())
    }

    #[instrument(skip(self, job, device), fields(job_id = %job.id))]
    async fn restore(&self, job: &Job, volume_id: &str, device: &mut dyn DeviceIo) -> Result<()> {
        self.enter(DriverOp::Restore)?;
        let data = self
            .backup_data(&job.id)
            .ok_or_else(|| WorkflowError::DriverFailed(format!("no data for job {}", job.id)))?;
        device
            .write_all(&data)
            .await
            .map_err(|e| WorkflowError::DriverFailed(format!("write failed: {}", e)))?;
        device
            .flush()
            .await
            .map_err(|e| WorkflowError::DriverFailed(format!("flush failed: {}", e)))?;
        debug!(bytes = data.len(), "Mock restore written");
        Ok(())
    }

    async fn delete(&self, job: &Job) -> Result<()> {
        self.enter(DriverOp::Delete)?;
        self.backups.write().map_err(poisoned)?.remove(&job.id);
        Ok(())
    }

    async fn export_record(&self, job: &Job) -> Result<serde_json::Value> {
        self.enter(DriverOp::Export)?;
        let length = self.backup_data(&job.id).map(|d| d.len()).unwrap_or(0);
        Ok(serde_json::json!({ "object": job.id, "length": length }))
    }

    async fn import_record(&self, job: &Job, info: &serde_json::Value) -> Result<()> {
        self.enter(DriverOp::Import)?;
        if info.get("object").is_none() {
            return Err(WorkflowError::DriverFailed("driver info has no object".to_string()));
        }
        let mut backups = self.backups.write().map_err(poisoned)?;
        backups.entry(job.id.clone()).or_default();
        Ok(())
    }

    fn supports_verify(&self) -> bool {
        self.verify_supported.load(Ordering::SeqCst)
    }

    async fn verify(&self, job_id: &str) -> Result<()> {
        if !self.supports_verify() {
            return Err(WorkflowError::UnsupportedOperation(format!(
                "driver {} cannot verify job {}",
                self.name, job_id
            )));
        }
        self.enter(DriverOp::Verify)?;
        if self.backup_data(job_id).is_none() {
            return Err(WorkflowError::DriverFailed(format!("no data for job {}", job_id)));
        }
        Ok(())
    }

    fn support_force_delete(&self) -> bool {
        self.force_delete.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Volume service
// =============================================================================

/// Volume-service calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeOp {
    GetBackupDevice,
    InitializeConnection,
    TerminateConnection,
    RemoveExport,
    DetachVolume,
    DeleteVolume,
    DeleteSnapshot,
}

/// In-memory volume service handing out a single scratch device file.
pub struct MockVolumeService {
    device_path: PathBuf,
    _scratch: Option<tempfile::NamedTempFile>,
    create_temp_volume: AtomicBool,
    create_temp_snapshot: AtomicBool,
    secure: AtomicBool,
    temp_volumes: RwLock<HashSet<String>>,
    temp_snapshots: RwLock<HashSet<String>>,
    failures: RwLock<HashSet<VolumeOp>>,
    calls: Mutex<Vec<String>>,
}

impl MockVolumeService {
    /// Hand out `device_path` as the device of every connection.
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            _scratch: None,
            create_temp_volume: AtomicBool::new(false),
            create_temp_snapshot: AtomicBool::new(false),
            secure: AtomicBool::new(false),
            temp_volumes: RwLock::new(HashSet::new()),
            temp_snapshots: RwLock::new(HashSet::new()),
            failures: RwLock::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Hand out a fresh scratch file that lives as long as the service.
    pub fn with_scratch_device() -> Result<Self> {
        let scratch = tempfile::NamedTempFile::new()
            .map_err(|e| WorkflowError::Internal(format!("Failed to create scratch device: {}", e)))?;
        let mut service = Self::new(scratch.path());
        service._scratch = Some(scratch);
        Ok(service)
    }

    /// Path of the device handed out.
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Create a scratch volume for every backup.
    pub fn with_temp_volume(self, enabled: bool) -> Self {
        self.create_temp_volume.store(enabled, Ordering::SeqCst);
        self
    }

    /// Create a scratch snapshot for every backup and back up from it.
    pub fn with_temp_snapshot(self, enabled: bool) -> Self {
        self.create_temp_snapshot.store(enabled, Ordering::SeqCst);
        self
    }

    /// Report the transport as already secure.
    pub fn with_secure(self, secure: bool) -> Self {
        self.secure.store(secure, Ordering::SeqCst);
        self
    }

    /// Make `op` fail until cleared.
    pub fn fail_on(&self, op: VolumeOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(op);
        }
    }

    /// Clear all injected failures.
    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.write() {
            failures.clear();
        }
    }

    /// Register a scratch volume as existing.
    pub fn add_temp_volume(&self, id: &str) {
        if let Ok(mut volumes) = self.temp_volumes.write() {
            volumes.insert(id.to_string());
        }
    }

    /// Register a scratch snapshot as existing.
    pub fn add_temp_snapshot(&self, id: &str) {
        if let Ok(mut snapshots) = self.temp_snapshots.write() {
            snapshots.insert(id.to_string());
        }
    }

    /// Scratch volumes and snapshots that still exist.
    pub fn live_temp_resources(&self) -> usize {
        let volumes = self.temp_volumes.read().map(|v| v.len()).unwrap_or(0);
        let snapshots = self.temp_snapshots.read().map(|s| s.len()).unwrap_or(0);
        volumes + snapshots
    }

    /// Every call made so far, e.g. `terminate_connection(vol-1, force=true)`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls whose log entry starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn enter(&self, op: VolumeOp, entry: String) -> Result<()> {
        self.calls.lock().map_err(poisoned)?.push(entry);
        if self.failures.read().map_err(poisoned)?.contains(&op) {
            return Err(WorkflowError::VolumeServiceFailed(format!("injected {:?} failure", op)));
        }
        Ok(())
    }

    fn connection(&self) -> ConnectionInfo {
        ConnectionInfo::new(MOCK_PROTOCOL).with("device_path", self.device_path.to_string_lossy())
    }
}

#[async_trait]
impl VolumeService for MockVolumeService {
    async fn get_backup_device(&self, _ctx: &RequestContext, job: &Job) -> Result<BackupDevice> {
        self.enter(VolumeOp::GetBackupDevice, format!("get_backup_device({})", job.id))?;

        let mut device = match job.snapshot_id.as_deref() {
            Some(snapshot_id) => BackupDevice::snapshot(snapshot_id),
            None => BackupDevice::volume(&job.volume_id),
        };
        device.secure_enabled = self.secure.load(Ordering::SeqCst);

        if self.create_temp_snapshot.load(Ordering::SeqCst) {
            let id = format!("tmp-snap-{}", job.id);
            self.add_temp_snapshot(&id);
            device.device_id = id.clone();
            device.is_snapshot = true;
            device.temp_snapshot_id = Some(id);
        }
        if self.create_temp_volume.load(Ordering::SeqCst) {
            let id = format!("tmp-vol-{}", job.id);
            self.add_temp_volume(&id);
            device.device_id = id.clone();
            device.is_snapshot = false;
            device.temp_volume_id = Some(id);
        }
        Ok(device)
    }

    async fn initialize_connection(
        &self,
        _ctx: &RequestContext,
        volume_id: &str,
        _props: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        self.enter(VolumeOp::InitializeConnection, format!("initialize_connection({})", volume_id))?;
        Ok(self.connection())
    }

    async fn initialize_connection_snapshot(
        &self,
        _ctx: &RequestContext,
        snapshot_id: &str,
        _props: &ConnectorProperties,
    ) -> Result<ConnectionInfo> {
        self.enter(
            VolumeOp::InitializeConnection,
            format!("initialize_connection_snapshot({})", snapshot_id),
        )?;
        Ok(self.connection())
    }

    async fn terminate_connection(
        &self,
        _ctx: &RequestContext,
        volume_id: &str,
        _props: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        self.enter(
            VolumeOp::TerminateConnection,
            format!("terminate_connection({}, force={})", volume_id, force),
        )
    }

    async fn terminate_connection_snapshot(
        &self,
        _ctx: &RequestContext,
        snapshot_id: &str,
        _props: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        self.enter(
            VolumeOp::TerminateConnection,
            format!("terminate_connection_snapshot({}, force={})", snapshot_id, force),
        )
    }

    async fn remove_export(&self, _ctx: &RequestContext, volume_id: &str) -> Result<()> {
        self.enter(VolumeOp::RemoveExport, format!("remove_export({})", volume_id))
    }

    async fn remove_export_snapshot(&self, _ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        self.enter(VolumeOp::RemoveExport, format!("remove_export_snapshot({})", snapshot_id))
    }

    async fn detach_volume(&self, _ctx: &RequestContext, volume_id: &str, attachment_id: &str) -> Result<()> {
        self.enter(
            VolumeOp::DetachVolume,
            format!("detach_volume({}, {})", volume_id, attachment_id),
        )
    }

    async fn delete_volume(&self, _ctx: &RequestContext, volume_id: &str) -> Result<()> {
        self.enter(VolumeOp::DeleteVolume, format!("delete_volume({})", volume_id))?;
        if !self.temp_volumes.write().map_err(poisoned)?.remove(volume_id) {
            return Err(WorkflowError::VolumeNotFound(volume_id.to_string()));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, _ctx: &RequestContext, snapshot_id: &str) -> Result<()> {
        self.enter(VolumeOp::DeleteSnapshot, format!("delete_snapshot({})", snapshot_id))?;
        if !self.temp_snapshots.write().map_err(poisoned)?.remove(snapshot_id) {
            return Err(WorkflowError::VolumeNotFound(snapshot_id.to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Connector for the mock volume service's scratch devices.
#[derive(Default)]
pub struct MockConnector {
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect_volume` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make non-forced `disconnect_volume` fail.
    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceConnector for MockConnector {
    fn protocol(&self) -> &str {
        MOCK_PROTOCOL
    }

    async fn connect_volume(&self, conn: &ConnectionInfo) -> Result<AttachedDevice> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(WorkflowError::ConnectorFailed("injected connect failure".to_string()));
        }
        Ok(AttachedDevice {
            path: PathBuf::from(conn.require("device_path")?),
            protocol: MOCK_PROTOCOL.to_string(),
        })
    }

    async fn disconnect_volume(
        &self,
        _conn: &ConnectionInfo,
        _device: &AttachedDevice,
        force: bool,
    ) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if !force && self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(WorkflowError::ConnectorFailed("injected disconnect failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_driver_backup_and_restore() {
        let driver = MockDriver::new();
        let job = Job::new("vol-1");

        let mut source = Cursor::new(b"block data".to_vec());
        driver.backup(&job, &mut source).await.unwrap();
        assert_eq!(driver.backup_data(&job.id).unwrap(), b"block data");

        let mut target = Cursor::new(Vec::new());
        driver.restore(&job, "vol-2", &mut target).await.unwrap();
        assert_eq!(target.into_inner(), b"block data");
        assert_eq!(driver.call_count(DriverOp::Backup), 1);
    }

    #[tokio::test]
    async fn test_driver_failure_injection() {
        let driver = MockDriver::new();
        let job = Job::new("vol-1");
        driver.fail_on(DriverOp::Delete);
        assert!(matches!(driver.delete(&job).await, Err(WorkflowError::DriverFailed(_))));
        driver.clear_failures();
        assert!(driver.delete(&job).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_unsupported_by_default() {
        let driver = MockDriver::new();
        assert!(!driver.supports_verify());
        assert!(matches!(
            driver.verify("b1").await,
            Err(WorkflowError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_volume_service_temp_resources() {
        let service = MockVolumeService::new("/dev/null").with_temp_volume(true);
        let ctx = RequestContext::admin();
        let job = Job::new("vol-1");

        let device = service.get_backup_device(&ctx, &job).await.unwrap();
        assert_eq!(device.temp_volume_id, Some(format!("tmp-vol-{}", job.id)));
        assert_eq!(service.live_temp_resources(), 1);

        service.delete_volume(&ctx, &device.device_id).await.unwrap();
        assert!(service
            .delete_volume(&ctx, &device.device_id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_connector_forced_disconnect_succeeds() {
        let connector = MockConnector::new();
        connector.fail_disconnect(true);
        let conn = ConnectionInfo::new(MOCK_PROTOCOL).with("device_path", "/dev/null");
        let device = connector.connect_volume(&conn).await.unwrap();

        assert!(connector.disconnect_volume(&conn, &device, false).await.is_err());
        assert!(connector.disconnect_volume(&conn, &device, true).await.is_ok());
        assert_eq!(connector.disconnect_count(), 2);
    }
}
