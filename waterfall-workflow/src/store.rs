//! Job and volume persistence.
//!
//! The manager only needs keyed reads and writes, a list-by-host query and
//! two atomic updates: a compare-and-swap on job status and an
//! increment/decrement of the dependent-job counter.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::error::{Result, WorkflowError};
use crate::types::{Job, JobStatus, Volume};

/// Persistence store trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load a live job. `JobNotFound` if absent or destroyed.
    async fn get_job(&self, id: &str) -> Result<Job>;

    /// Insert or overwrite a job record.
    async fn save_job(&self, job: &Job) -> Result<()>;

    /// Soft-delete a job record.
    async fn destroy_job(&self, id: &str) -> Result<()>;

    /// Live jobs whose `host` equals `host`.
    async fn list_jobs_by_host(&self, host: &str) -> Result<Vec<Job>>;

    /// Load a volume. `VolumeNotFound` if absent.
    async fn get_volume(&self, id: &str) -> Result<Volume>;

    /// Insert or overwrite a volume record.
    async fn save_volume(&self, volume: &Volume) -> Result<()>;

    /// Set a job's status to `new` only if it is currently `expected`.
    ///
    /// Returns whether the swap happened.
    async fn update_job_status(&self, id: &str, expected: JobStatus, new: JobStatus) -> Result<bool>;

    /// Add `delta` to a job's dependent counter, saturating at zero.
    ///
    /// Returns the new value.
    async fn adjust_dependent_count(&self, id: &str, delta: i32) -> Result<u32>;
}

/// In-memory store.
///
/// Each method takes the lock once, so the atomic updates really are
/// atomic with respect to every other call.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
    volumes: RwLock<HashMap<String, Volume>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a job including soft-deleted ones.
    pub fn get_job_any(&self, id: &str) -> Result<Job> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| WorkflowError::StoreFailed("Lock poisoned".to_string()))?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::JobNotFound(id.to_string()))
    }

    /// Number of live jobs.
    pub fn job_count(&self) -> usize {
        self.jobs
            .read()
            .map(|jobs| jobs.values().filter(|j| !j.deleted).count())
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> WorkflowError {
    WorkflowError::StoreFailed("Lock poisoned".to_string())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get_job(&self, id: &str) -> Result<Job> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(id)
            .filter(|j| !j.deleted)
            .cloned()
            .ok_or_else(|| WorkflowError::JobNotFound(id.to_string()))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut record = job.clone();
        record.updated_at = Utc::now();
        self.jobs.write().map_err(poisoned)?.insert(record.id.clone(), record);
        debug!("Job saved");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy_job(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(id)
            .filter(|j| !j.deleted)
            .ok_or_else(|| WorkflowError::JobNotFound(id.to_string()))?;
        job.deleted = true;
        job.updated_at = Utc::now();
        debug!("Job destroyed");
        Ok(())
    }

    async fn list_jobs_by_host(&self, host: &str) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| !j.deleted && j.host.as_deref() == Some(host))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        let volumes = self.volumes.read().map_err(poisoned)?;
        volumes
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::VolumeNotFound(id.to_string()))
    }

    #[instrument(skip(self, volume), fields(volume_id = %volume.id, status = %volume.status))]
    async fn save_volume(&self, volume: &Volume) -> Result<()> {
        self.volumes
            .write()
            .map_err(poisoned)?
            .insert(volume.id.clone(), volume.clone());
        debug!("Volume saved");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_job_status(&self, id: &str, expected: JobStatus, new: JobStatus) -> Result<bool> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(id)
            .filter(|j| !j.deleted)
            .ok_or_else(|| WorkflowError::JobNotFound(id.to_string()))?;

        if job.status != expected {
            debug!(actual = %job.status, "Status swap lost");
            return Ok(false);
        }
        job.override_status(new, None);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn adjust_dependent_count(&self, id: &str, delta: i32) -> Result<u32> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| WorkflowError::JobNotFound(id.to_string()))?;

        let next = (i64::from(job.num_dependent_workflows) + i64::from(delta)).max(0);
        job.num_dependent_workflows = u32::try_from(next)
            .map_err(|_| WorkflowError::StoreFailed(format!("dependent counter overflow on {}", id)))?;
        job.updated_at = Utc::now();
        Ok(job.num_dependent_workflows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeStatus;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_destroy_is_soft() {
        let store = MemoryStore::new();
        let job = Job::new("vol-1");
        store.save_job(&job).await.unwrap();

        store.destroy_job(&job.id).await.unwrap();
        assert!(store.get_job(&job.id).await.unwrap_err().is_not_found());
        assert!(store.get_job_any(&job.id).unwrap().deleted);
        assert!(store.destroy_job(&job.id).await.is_err());
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_list_by_host() {
        let store = MemoryStore::new();
        let mut a = Job::new("vol-1");
        a.host = Some("node1@simple".into());
        let mut b = Job::new("vol-2");
        b.host = Some("node2@simple".into());
        store.save_job(&a).await.unwrap();
        store.save_job(&b).await.unwrap();

        let jobs = store.list_jobs_by_host("node1@simple").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, a.id);
    }

    #[tokio::test]
    async fn test_update_job_status_is_cas() {
        let store = MemoryStore::new();
        let job = Job::new("vol-1").with_status(JobStatus::Available);
        store.save_job(&job).await.unwrap();

        assert!(store
            .update_job_status(&job.id, JobStatus::Available, JobStatus::Deleting)
            .await
            .unwrap());
        assert!(!store
            .update_job_status(&job.id, JobStatus::Available, JobStatus::Restoring)
            .await
            .unwrap());
        assert_eq!(store.get_job(&job.id).await.unwrap().status, JobStatus::Deleting);
    }

    #[tokio::test]
    async fn test_concurrent_dependent_counter() {
        let store = Arc::new(MemoryStore::new());
        let parent = Job::new("vol-1");
        store.save_job(&parent).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let id = parent.id.clone();
            handles.push(tokio::spawn(async move {
                store.adjust_dependent_count(&id, 1).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get_job(&parent.id).await.unwrap().num_dependent_workflows, 50);

        // Saturates at zero
        assert_eq!(store.adjust_dependent_count(&parent.id, -100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_volume_round_trip() {
        let store = MemoryStore::new();
        let volume = Volume::new("vol-1", 10, VolumeStatus::Other("maintenance".into()));
        store.save_volume(&volume).await.unwrap();
        assert_eq!(store.get_volume("vol-1").await.unwrap(), volume);
        assert!(matches!(
            store.get_volume("vol-2").await,
            Err(WorkflowError::VolumeNotFound(_))
        ));
    }
}
