//! Simple file-per-job backup driver.
//!
//! Each job's data is kept as a single image file under a base directory.
//! It's suitable for development, testing, and single-node deployments.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::driver::{BackendDriver, DeviceIo};
use crate::error::{Result, WorkflowError};
use crate::types::Job;

/// Name recorded as `Job::service` for jobs created by this driver.
pub const DRIVER_NAME: &str = "waterfall.workflow.drivers.simple.SimpleDriver";

/// Default directory for backup images.
pub const DEFAULT_BACKUP_PATH: &str = "/var/lib/waterfall/backups";

/// Driver information carried inside exported records.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimpleRecordInfo {
    /// Image file name relative to the base path
    object: String,
    /// Image length in bytes
    length: u64,
}

/// File-per-job backup driver.
pub struct SimpleDriver {
    /// Base path for backup images
    base_path: PathBuf,
}

impl SimpleDriver {
    /// Create a driver with the default path.
    pub fn new() -> Self {
        Self::with_path(DEFAULT_BACKUP_PATH)
    }

    /// Create a driver with a custom base path.
    pub fn with_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_name(job_id: &str) -> String {
        format!("{}.img", job_id)
    }

    fn image_path(&self, job_id: &str) -> PathBuf {
        self.base_path.join(Self::object_name(job_id))
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to create directory {}: {}", path.display(), e))
        })
    }

    async fn image_len(&self, job_id: &str) -> Result<u64> {
        let path = self.image_path(job_id);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Backup image {} unavailable: {}", path.display(), e))
        })?;
        Ok(metadata.len())
    }
}

impl Default for SimpleDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDriver for SimpleDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    #[instrument(skip(self, job, device), fields(job_id = %job.id))]
    async fn backup(&self, job: &Job, device: &mut dyn DeviceIo) -> Result<()> {
        self.ensure_dir(&self.base_path).await?;

        let path = self.image_path(&job.id);
        // Written under a temporary name so a crash never leaves a partial image
        let partial = path.with_extension("img.partial");

        let mut file = tokio::fs::File::create(&partial).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to create {}: {}", partial.display(), e))
        })?;

        let copied = tokio::io::copy(&mut *device, &mut file).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to read device: {}", e))
        })?;

        file.sync_all().await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to sync {}: {}", partial.display(), e))
        })?;

        tokio::fs::rename(&partial, &path).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to finalize {}: {}", path.display(), e))
        })?;

        info!(bytes = copied, path = %path.display(), "Backup image written");
        Ok(())
    }

    #[instrument(skip(self, job, device), fields(job_id = %job.id, volume_id = %volume_id))]
    async fn restore(&self, job: &Job, volume_id: &str, device: &mut dyn DeviceIo) -> Result<()> {
        let path = self.image_path(&job.id);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let copied = tokio::io::copy(&mut file, &mut *device).await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to write device: {}", e))
        })?;

        device.flush().await.map_err(|e| {
            WorkflowError::DriverFailed(format!("Failed to flush device: {}", e))
        })?;

        info!(bytes = copied, "Backup image restored");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn delete(&self, job: &Job) -> Result<()> {
        let path = self.image_path(&job.id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "Backup image deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Backup image already gone");
                Ok(())
            }
            Err(e) => Err(WorkflowError::DriverFailed(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn export_record(&self, job: &Job) -> Result<serde_json::Value> {
        let info = SimpleRecordInfo {
            object: Self::object_name(&job.id),
            length: self.image_len(&job.id).await?,
        };
        Ok(serde_json::to_value(info)?)
    }

    #[instrument(skip(self, job, info), fields(job_id = %job.id))]
    async fn import_record(&self, job: &Job, info: &serde_json::Value) -> Result<()> {
        let info: SimpleRecordInfo = serde_json::from_value(info.clone()).map_err(|e| {
            WorkflowError::DriverFailed(format!("Malformed driver info: {}", e))
        })?;

        if info.object != Self::object_name(&job.id) {
            return Err(WorkflowError::DriverFailed(format!(
                "Record object {} does not belong to job {}",
                info.object, job.id
            )));
        }

        debug!(object = %info.object, length = info.length, "Imported simple record");
        Ok(())
    }

    fn supports_verify(&self) -> bool {
        true
    }

    #[instrument(skip(self))]
    async fn verify(&self, job_id: &str) -> Result<()> {
        let len = self.image_len(job_id).await?;
        if len == 0 {
            return Err(WorkflowError::DriverFailed(format!("Backup image for {} is empty", job_id)));
        }
        Ok(())
    }

    fn support_force_delete(&self) -> bool {
        true
    }
}
