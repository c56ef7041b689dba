//! Backend driver trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, WorkflowError};
use crate::types::Job;

/// A raw device handle the driver streams backup data through.
pub trait DeviceIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceIo for T {}

/// Backend driver trait - implemented by each backup target.
///
/// The backup data format is entirely the driver's business. The manager
/// only hands it an attached device and a job record.
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Driver name recorded as `Job::service`.
    fn name(&self) -> &str;

    /// Read the attached device and store its contents for `job`.
    async fn backup(&self, job: &Job, device: &mut dyn DeviceIo) -> Result<()>;

    /// Write the data stored for `job` onto the attached device of `volume_id`.
    async fn restore(&self, job: &Job, volume_id: &str, device: &mut dyn DeviceIo) -> Result<()>;

    /// Remove the data stored for `job`.
    async fn delete(&self, job: &Job) -> Result<()>;

    /// Opaque, driver-specific information needed to import `job` elsewhere.
    async fn export_record(&self, job: &Job) -> Result<serde_json::Value>;

    /// Make a job exported elsewhere known to this driver.
    async fn import_record(&self, job: &Job, info: &serde_json::Value) -> Result<()>;

    /// Whether `verify` is implemented.
    fn supports_verify(&self) -> bool {
        false
    }

    /// Check that the stored data for `job_id` is intact.
    async fn verify(&self, job_id: &str) -> Result<()> {
        Err(WorkflowError::UnsupportedOperation(format!(
            "driver {} cannot verify job {}",
            self.name(),
            job_id
        )))
    }

    /// Whether jobs may be deleted while in a non-terminal state.
    fn support_force_delete(&self) -> bool {
        false
    }
}

/// Supported driver kinds, selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// File-per-job driver writing under a local directory
    Simple,
    /// In-memory driver for testing/development
    Mock,
}

impl DriverKind {
    /// Name the driver records as `Job::service`.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverKind::Simple => crate::drivers::simple::DRIVER_NAME,
            DriverKind::Mock => crate::mock::MOCK_DRIVER_NAME,
        }
    }
}

impl Default for DriverKind {
    fn default() -> Self {
        Self::Simple
    }
}
