//! Workflow lifecycle manager.
//!
//! One manager runs per backend on each node, bound to a `hostname@backend`
//! host string. It owns the job state machine for every job whose `host`
//! equals its own:
//!
//! ```text
//!   creating ──► available ◄──► restoring
//!                   │
//!                   ▼
//!   error ──────► deleting ──► (destroyed)
//!
//!   any state ──► error
//! ```
//!
//! Every operation validates the persisted status first, transitions,
//! does its work and leaves job and volume in a safe terminal status on
//! every exit path before returning the error to the caller. Whatever the
//! synchronous path could not repair is picked up by [`WorkflowManager::init_host`]
//! on the next start.

use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tokio::fs::OpenOptions;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::connector::{AttachedDevice, ConnectionInfo, ConnectorProperties, ConnectorSet, TemporaryOwnership};
use crate::driver::BackendDriver;
use crate::error::{Result, WorkflowError};
use crate::events::{Notification, Notifier, Phase};
use crate::host::HostRouter;
use crate::quota::{QuotaDeltas, QuotaLedger, Reservation};
use crate::rpc::WorkflowRpcClient;
use crate::store::JobStore;
use crate::types::{ExportedRecord, Job, JobStatus, RequestContext, Volume, VolumeStatus};
use crate::volume::{BackupDevice, VolumeService};

/// Reason recorded on jobs found mid-backup at startup.
pub const INCOMPLETE_JOB_REASON: &str = "incomplete job reset on manager restart";

/// Fields an imported record must carry.
const REQUIRED_RECORD_FIELDS: [&str; 5] = ["id", "volume_id", "size", "service", "driver_info"];

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// `hostname@backend` this manager owns
    pub host: String,
    /// Availability zone recorded on created jobs
    pub availability_zone: Option<String>,
    /// Run deletes found at startup on the worker pool instead of inline
    pub offload_deletes: bool,
    /// Size of the offloaded-delete worker pool
    pub max_concurrent_operations: usize,
}

impl ManagerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            availability_zone: None,
            offload_deletes: false,
            max_concurrent_operations: 4,
        }
    }
}

/// Collaborators handed to the manager.
pub struct ManagerDeps {
    pub store: Arc<dyn JobStore>,
    pub volumes: Arc<dyn VolumeService>,
    pub connectors: Arc<ConnectorSet>,
    pub quota: Arc<dyn QuotaLedger>,
    pub notifier: Arc<dyn Notifier>,
    /// Used to relay imports to other candidate hosts
    pub rpc: Option<WorkflowRpcClient>,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Jobs found in `creating` and moved to `error`
    pub reset_creating: usize,
    /// Jobs found in `restoring` and moved back to `available`
    pub reset_restoring: usize,
    /// Deletes resumed inline or handed to the pool
    pub resumed_deletes: usize,
    /// Jobs whose leaked scratch resources were all removed
    pub cleaned_temp: usize,
}

/// Direction of a data-movement run.
enum Transfer<'a> {
    Backup,
    Restore { volume_id: &'a str },
}

/// A device attached for one run.
struct Attachment {
    conn: ConnectionInfo,
    device: AttachedDevice,
}

/// Record fields applied to the local job on import.
#[derive(Debug, Deserialize)]
struct PortableJob {
    volume_id: String,
    size: u64,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    snapshot_id: Option<String>,
}

/// Exclusive right to run one operation on a job, released on drop.
struct JobClaim<'a> {
    claims: &'a std::sync::Mutex<HashSet<String>>,
    job_id: String,
}

impl Drop for JobClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.job_id);
        }
    }
}

/// The workflow lifecycle manager.
pub struct WorkflowManager {
    config: ManagerConfig,
    router: Arc<HostRouter>,
    backend: String,
    driver: Arc<dyn BackendDriver>,
    store: Arc<dyn JobStore>,
    volumes: Arc<dyn VolumeService>,
    connectors: Arc<ConnectorSet>,
    quota: Arc<dyn QuotaLedger>,
    notifier: Arc<dyn Notifier>,
    rpc: Option<WorkflowRpcClient>,
    delete_permits: Arc<Semaphore>,
    offloaded: Mutex<JoinSet<()>>,
    claims: std::sync::Mutex<HashSet<String>>,
}

impl WorkflowManager {
    /// Create a manager for the backend named in `config.host`.
    pub fn new(config: ManagerConfig, router: Arc<HostRouter>, deps: ManagerDeps) -> Result<Self> {
        let backend = router.backend_for(Some(&config.host), true)?;
        let driver = router.driver_for(&backend)?;
        let permits = config.max_concurrent_operations.max(1);

        info!(
            host = %config.host,
            backend = %backend,
            driver = %driver.name(),
            "Workflow manager created"
        );

        Ok(Self {
            delete_permits: Arc::new(Semaphore::new(permits)),
            offloaded: Mutex::new(JoinSet::new()),
            claims: std::sync::Mutex::new(HashSet::new()),
            config,
            router,
            backend,
            driver,
            store: deps.store,
            volumes: deps.volumes,
            connectors: deps.connectors,
            quota: deps.quota,
            notifier: deps.notifier,
            rpc: deps.rpc,
        })
    }

    /// Host string this manager owns.
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Backend this manager is bound to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Name of the local driver, recorded as `Job::service`.
    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    // =========================================================================
    // Startup reconciliation
    // =========================================================================

    /// Repair jobs left mid-operation by a previous run of this host.
    ///
    /// Failures on one job are logged and do not stop the pass. Running it
    /// twice in a row leaves the same state as running it once.
    #[instrument(skip(self, ctx), fields(host = %self.config.host, request_id = %ctx.request_id()))]
    pub async fn init_host(self: &Arc<Self>, ctx: &RequestContext) -> Result<ReconcileSummary> {
        let jobs = self.store.list_jobs_by_host(&self.config.host).await?;
        info!(count = jobs.len(), "Reconciling jobs");

        let mut summary = ReconcileSummary::default();
        for job in jobs {
            let job_id = job.id.clone();
            let result = match job.status {
                JobStatus::Creating => {
                    summary.reset_creating += 1;
                    self.reset_interrupted_create(ctx, job).await
                }
                JobStatus::Restoring => {
                    summary.reset_restoring += 1;
                    self.reset_interrupted_restore(ctx, job).await
                }
                JobStatus::Deleting => {
                    summary.resumed_deletes += 1;
                    if self.config.offload_deletes {
                        self.spawn_offloaded_delete(ctx, job).await;
                        Ok(())
                    } else {
                        info!(job_id = %job_id, "Resuming delete inline");
                        self.delete_job(ctx, job).await
                    }
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                error!(job_id = %job_id, error = %e, "Failed to reconcile job");
            }
        }

        summary.cleaned_temp = self.cleanup_leaked_resources(ctx).await?;
        info!(?summary, "Reconciliation complete");
        Ok(summary)
    }

    async fn reset_interrupted_create(&self, ctx: &RequestContext, mut job: Job) -> Result<()> {
        info!(job_id = %job.id, volume_id = %job.volume_id, "Resetting job interrupted while creating");

        match self.store.get_volume(&job.volume_id).await {
            Ok(volume) => {
                if volume.status == VolumeStatus::BackingUp {
                    self.detach_backup_attachments(ctx, &volume).await;
                    let mut volume = self.store.get_volume(&job.volume_id).await?;
                    volume.status = volume.previous_status.clone().unwrap_or(VolumeStatus::Available);
                    volume.previous_status = Some(VolumeStatus::ErrorBackingUp);
                    self.store.save_volume(&volume).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(volume_id = %job.volume_id, "Source volume no longer exists")
            }
            Err(e) => return Err(e),
        }

        job.transition(JobStatus::Error, Some(INCOMPLETE_JOB_REASON.to_string()))?;
        self.store.save_job(&job).await
    }

    /// Best-effort release of attachments a backup made on this host.
    async fn detach_backup_attachments(&self, ctx: &RequestContext, volume: &Volume) {
        for attachment in volume.backup_attachments_on(&self.config.host) {
            match self.volumes.detach_volume(ctx, &volume.id, &attachment.id).await {
                Ok(()) => info!(
                    volume_id = %volume.id,
                    attachment_id = %attachment.id,
                    "Released backup attachment"
                ),
                Err(e) => warn!(
                    volume_id = %volume.id,
                    attachment_id = %attachment.id,
                    error = %e,
                    "Failed to release backup attachment"
                ),
            }
        }
    }

    async fn reset_interrupted_restore(&self, ctx: &RequestContext, mut job: Job) -> Result<()> {
        info!(job_id = %job.id, request_id = %ctx.request_id(), "Resetting job interrupted while restoring");

        if let Some(volume_id) = job.restore_volume_id.take() {
            match self.store.get_volume(&volume_id).await {
                Ok(mut volume) if volume.status == VolumeStatus::RestoringWorkflow => {
                    volume.status = VolumeStatus::ErrorRestoring;
                    self.store.save_volume(&volume).await?;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    warn!(volume_id = %volume_id, "Restore target no longer exists")
                }
                Err(e) => return Err(e),
            }
        }

        job.transition(JobStatus::Available, None)?;
        self.store.save_job(&job).await
    }

    /// Remove scratch resources left on failed jobs of this host.
    ///
    /// Returns the number of jobs left with no scratch references.
    #[instrument(skip(self, ctx), fields(host = %self.config.host))]
    pub async fn cleanup_leaked_resources(&self, ctx: &RequestContext) -> Result<usize> {
        let jobs = self.store.list_jobs_by_host(&self.config.host).await?;
        let mut cleaned = 0;

        for mut job in jobs {
            if job.status != JobStatus::Error || !job.has_temp_resources() {
                continue;
            }
            let Ok(_claim) = self.claim(&job.id) else {
                debug!(job_id = %job.id, "Job busy, leaving its scratch resources for the next sweep");
                continue;
            };
            debug!(job_id = %job.id, "Cleaning leaked scratch resources");
            if let Err(e) = self.cleanup_temp_resources(ctx, &mut job).await {
                warn!(job_id = %job.id, error = %e, "Failed to clean scratch resources");
            }
            if !job.has_temp_resources() {
                cleaned += 1;
            }
        }

        Ok(cleaned)
    }

    /// Delete the job's scratch snapshot and volume and clear the fields.
    ///
    /// A resource that fails to delete keeps its reference so a later
    /// pass can retry; one that is already gone counts as deleted.
    async fn cleanup_temp_resources(&self, ctx: &RequestContext, job: &mut Job) -> Result<()> {
        let mut changed = false;

        if let Some(snapshot_id) = job.temp_snapshot_id.clone() {
            match self.volumes.delete_snapshot(ctx, &snapshot_id).await {
                Ok(()) => changed = true,
                Err(e) if e.is_not_found() => {
                    debug!(snapshot_id = %snapshot_id, "Scratch snapshot already gone");
                    changed = true;
                }
                Err(e) => warn!(snapshot_id = %snapshot_id, error = %e, "Failed to delete scratch snapshot"),
            }
            if changed {
                job.temp_snapshot_id = None;
            }
        }

        if let Some(volume_id) = job.temp_volume_id.clone() {
            match self.volumes.delete_volume(ctx, &volume_id).await {
                Ok(()) => {
                    job.temp_volume_id = None;
                    changed = true;
                }
                Err(e) if e.is_not_found() => {
                    debug!(volume_id = %volume_id, "Scratch volume already gone");
                    job.temp_volume_id = None;
                    changed = true;
                }
                Err(e) => warn!(volume_id = %volume_id, error = %e, "Failed to delete scratch volume"),
            }
        }

        if changed {
            self.store.save_job(job).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Offloaded deletes
    // =========================================================================

    async fn spawn_offloaded_delete(self: &Arc<Self>, ctx: &RequestContext, job: Job) {
        info!(job_id = %job.id, "Offloading delete to worker pool");
        let this = Arc::clone(self);
        let permits = Arc::clone(&self.delete_permits);
        let ctx = ctx.clone();

        self.offloaded.lock().await.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let job_id = job.id.clone();
            if let Err(e) = this.delete_job(&ctx, job).await {
                error!(job_id = %job_id, error = %e, "Offloaded delete failed");
            }
        });
    }

    /// Wait for every offloaded delete started so far.
    ///
    /// Returns the number of tasks that finished.
    pub async fn wait_for_offloaded_deletes(&self) -> usize {
        let mut tasks = std::mem::replace(&mut *self.offloaded.lock().await, JoinSet::new());
        let mut finished = 0;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Offloaded delete task panicked");
            }
            finished += 1;
        }
        finished
    }

    // =========================================================================
    // Operations
    // =========================================================================

    fn notify(&self, ctx: &RequestContext, operation: &str, phase: Phase, job: &Job) {
        self.notifier.notify(Notification::new(ctx, operation, phase, job));
    }

    fn report<T>(&self, ctx: &RequestContext, operation: &str, job: &Job, result: &Result<T>) {
        let notification = match result {
            Ok(_) => Notification::new(ctx, operation, Phase::End, job),
            Err(e) => Notification::new(ctx, operation, Phase::Error, job).with_message(e.to_string()),
        };
        self.notifier.notify(notification);
    }

    /// Claim `job_id` for one operation.
    ///
    /// A second operation on the same job while the first runs fails with
    /// `InvalidJob` before touching anything.
    fn claim(&self, job_id: &str) -> Result<JobClaim<'_>> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| WorkflowError::Internal("Lock poisoned".to_string()))?;
        if !claims.insert(job_id.to_string()) {
            warn!(job_id = %job_id, "Operation already in progress on job");
            return Err(WorkflowError::InvalidJob(format!(
                "job {} already has an operation in progress",
                job_id
            )));
        }
        Ok(JobClaim {
            claims: &self.claims,
            job_id: job_id.to_string(),
        })
    }

    /// Reload the persisted job so preconditions see the stored status.
    async fn refresh(&self, job: &Job) -> Result<Job> {
        self.store.get_job(&job.id).await
    }

    /// `ServiceMismatch` unless the job was created by the local driver.
    fn check_service(&self, job: &Job) -> Result<()> {
        match job.service.as_deref() {
            Some(service) if !self.router.service_matches(service, self.driver.as_ref()) => {
                Err(WorkflowError::ServiceMismatch {
                    job_id: job.id.clone(),
                    expected: service.to_string(),
                    actual: self.driver.name().to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Move the job to `error` and persist it, logging a failed save.
    async fn fail_job(&self, job: &mut Job, reason: &str) {
        job.override_status(JobStatus::Error, Some(reason.to_string()));
        if let Err(e) = self.store.save_job(job).await {
            error!(job_id = %job.id, error = %e, "Failed to persist job error status");
        }
    }

    /// Take a backup of the job's source volume.
    #[instrument(skip(self, ctx, job), fields(job_id = %job.id, volume_id = %job.volume_id, request_id = %ctx.request_id()))]
    pub async fn create_job(&self, ctx: &RequestContext, job: Job) -> Result<()> {
        let _claim = self.claim(&job.id)?;
        let mut job = self.refresh(&job).await?;
        self.notify(ctx, "create", Phase::Start, &job);

        let result = self.create_job_inner(ctx, &mut job).await;
        self.report(ctx, "create", &job, &result);
        result
    }

    async fn create_job_inner(&self, ctx: &RequestContext, job: &mut Job) -> Result<()> {
        let mut volume = match self.store.get_volume(&job.volume_id).await {
            Ok(volume) => volume,
            Err(e) => {
                self.fail_job(job, &e.to_string()).await;
                return Err(e);
            }
        };
        let previous_status = volume.previous_status.clone();

        job.host = Some(self.config.host.clone());
        job.service = Some(self.driver.name().to_string());
        job.availability_zone = self.config.availability_zone.clone();
        self.store.save_job(job).await?;

        if volume.status != VolumeStatus::BackingUp {
            let err = WorkflowError::InvalidVolume(format!(
                "volume {} is {}, expected {}",
                volume.id,
                volume.status,
                VolumeStatus::BackingUp
            ));
            self.fail_job(job, &err.to_string()).await;
            return Err(err);
        }

        if job.status != JobStatus::Creating {
            let err = WorkflowError::InvalidJob(format!(
                "job {} is {}, expected {}",
                job.id,
                job.status,
                JobStatus::Creating
            ));
            self.fail_job(job, &err.to_string()).await;
            return Err(err);
        }

        let outcome = self.run_job(ctx, job, Transfer::Backup).await;

        let result = match outcome {
            Ok(()) => self.finish_create(job, &mut volume, previous_status).await,
            Err(e) => {
                volume.status = previous_status.unwrap_or(VolumeStatus::ErrorBackingUp);
                volume.previous_status = Some(VolumeStatus::ErrorBackingUp);
                if let Err(save_err) = self.store.save_volume(&volume).await {
                    error!(volume_id = %volume.id, error = %save_err, "Failed to restore volume status");
                }
                self.fail_job(job, &e.to_string()).await;
                Err(e)
            }
        };

        if let Err(e) = self.cleanup_temp_resources(ctx, job).await {
            warn!(job_id = %job.id, error = %e, "Failed to clean scratch resources");
        }
        result
    }

    async fn finish_create(
        &self,
        job: &mut Job,
        volume: &mut Volume,
        previous_status: Option<VolumeStatus>,
    ) -> Result<()> {
        volume.status = previous_status.unwrap_or(VolumeStatus::Available);
        volume.previous_status = Some(VolumeStatus::BackingUp);
        self.store.save_volume(volume).await?;

        job.transition(JobStatus::Available, None)?;
        job.size = volume.size;
        self.store.save_job(job).await?;

        if let Some(parent_id) = job.parent_id.as_deref() {
            match self.store.adjust_dependent_count(parent_id, 1).await {
                Ok(count) => debug!(parent_id = %parent_id, count, "Parent dependent count incremented"),
                Err(e) => warn!(
                    parent_id = %parent_id,
                    error = %e,
                    "Failed to increment parent dependent count"
                ),
            }
        }

        info!(job_id = %job.id, size = job.size, "Backup created");
        Ok(())
    }

    /// Write the job's data onto `volume_id`.
    #[instrument(skip(self, ctx, job), fields(job_id = %job.id, request_id = %ctx.request_id()))]
    pub async fn restore_job(&self, ctx: &RequestContext, job: Job, volume_id: &str) -> Result<()> {
        let _claim = self.claim(&job.id)?;
        let mut job = self.refresh(&job).await?;
        self.notify(ctx, "restore", Phase::Start, &job);

        let result = self.restore_job_inner(ctx, &mut job, volume_id).await;
        self.report(ctx, "restore", &job, &result);
        result
    }

    async fn restore_job_inner(&self, ctx: &RequestContext, job: &mut Job, volume_id: &str) -> Result<()> {
        self.check_service(job)?;

        let mut volume = self.store.get_volume(volume_id).await?;

        if volume.status != VolumeStatus::RestoringWorkflow {
            if job.status == JobStatus::Restoring {
                job.transition(JobStatus::Available, None)?;
                self.store.save_job(job).await?;
            }
            return Err(WorkflowError::InvalidVolume(format!(
                "volume {} is {}, expected {}",
                volume.id,
                volume.status,
                VolumeStatus::RestoringWorkflow
            )));
        }

        if job.status != JobStatus::Restoring {
            volume.status = VolumeStatus::Error;
            self.store.save_volume(&volume).await?;
            return Err(WorkflowError::InvalidJob(format!(
                "job {} is {}, expected {}",
                job.id,
                job.status,
                JobStatus::Restoring
            )));
        }

        if volume.size > job.size {
            info!(
                volume_size = volume.size,
                job_size = job.size,
                "Target volume is larger than the backup, continuing"
            );
        }

        job.restore_volume_id = Some(volume_id.to_string());
        self.store.save_job(job).await?;

        let outcome = self.run_job(ctx, job, Transfer::Restore { volume_id }).await;

        volume.status = match outcome {
            Ok(()) => VolumeStatus::Available,
            Err(_) => VolumeStatus::ErrorRestoring,
        };
        if let Err(e) = self.store.save_volume(&volume).await {
            error!(volume_id = %volume.id, error = %e, "Failed to set restore target status");
        }

        job.restore_volume_id = None;
        job.transition(JobStatus::Available, None)?;
        self.store.save_job(job).await?;

        if outcome.is_ok() {
            info!(volume_id = %volume_id, "Restore complete");
        }
        outcome
    }

    /// Remove the job's data and destroy its record.
    #[instrument(skip(self, ctx, job), fields(job_id = %job.id, request_id = %ctx.request_id()))]
    pub async fn delete_job(&self, ctx: &RequestContext, job: Job) -> Result<()> {
        let _claim = self.claim(&job.id)?;
        let mut job = self.refresh(&job).await?;
        self.notify(ctx, "delete", Phase::Start, &job);

        let result = self.delete_job_inner(ctx, &mut job).await;
        self.report(ctx, "delete", &job, &result);
        result
    }

    async fn delete_job_inner(&self, ctx: &RequestContext, job: &mut Job) -> Result<()> {
        if job.status != JobStatus::Deleting {
            let err = WorkflowError::InvalidJob(format!(
                "job {} is {}, expected {}",
                job.id,
                job.status,
                JobStatus::Deleting
            ));
            self.fail_job(job, &err.to_string()).await;
            return Err(err);
        }

        self.check_service(job)?;

        // The stored status must still be deleting right before the driver runs
        if !self
            .store
            .update_job_status(&job.id, JobStatus::Deleting, JobStatus::Deleting)
            .await?
        {
            return Err(WorkflowError::InvalidJob(format!(
                "job {} left {} before its data was deleted",
                job.id,
                JobStatus::Deleting
            )));
        }

        if let Err(e) = self.driver.delete(job).await {
            self.fail_job(job, &e.to_string()).await;
            return Err(e);
        }

        let reservation = self.reserve_release(ctx, job).await;

        if let Err(e) = self.store.destroy_job(&job.id).await {
            if let Some(reservation) = &reservation {
                self.rollback_reservation(reservation).await;
            }
            return Err(e);
        }
        job.deleted = true;

        if let Some(parent_id) = job.parent_id.as_deref() {
            match self.store.adjust_dependent_count(parent_id, -1).await {
                Ok(count) => debug!(parent_id = %parent_id, count, "Parent dependent count decremented"),
                Err(e) => warn!(
                    parent_id = %parent_id,
                    error = %e,
                    "Failed to decrement parent dependent count"
                ),
            }
        }

        if let Some(reservation) = reservation {
            if let Err(e) = self.quota.commit(&reservation).await {
                error!(reservation_id = %reservation.id, error = %e, "Failed to commit quota release");
                self.rollback_reservation(&reservation).await;
            }
        }

        info!("Backup deleted");
        Ok(())
    }

    async fn rollback_reservation(&self, reservation: &Reservation) {
        match self.quota.rollback(reservation).await {
            Ok(()) => info!(reservation_id = %reservation.id, "Quota reservation rolled back"),
            Err(e) => error!(
                reservation_id = %reservation.id,
                project_id = %reservation.project_id,
                error = %e,
                "Failed to roll back quota reservation"
            ),
        }
    }

    /// Reserve the quota a delete gives back. Ledger failures are logged and
    /// the delete continues without a reservation.
    async fn reserve_release(&self, ctx: &RequestContext, job: &Job) -> Option<Reservation> {
        let project_id = job.project_id.as_deref().or(ctx.project_id.as_deref())?;

        match self.quota.reserve(project_id, QuotaDeltas::release(job.size)).await {
            Ok(reservation) => Some(reservation),
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    project_id = %project_id,
                    error = %e,
                    "Failed to reserve quota for delete, continuing without it"
                );
                None
            }
        }
    }

    /// Produce a portable record from which another deployment can import
    /// the job.
    #[instrument(skip(self, ctx, job), fields(job_id = %job.id, request_id = %ctx.request_id()))]
    pub async fn export_record(&self, ctx: &RequestContext, job: Job) -> Result<ExportedRecord> {
        let job = self.refresh(&job).await?;
        self.notify(ctx, "export", Phase::Start, &job);

        let result = self.export_record_inner(&job).await;
        self.report(ctx, "export", &job, &result);
        result
    }

    async fn export_record_inner(&self, job: &Job) -> Result<ExportedRecord> {
        if job.status != JobStatus::Available {
            return Err(WorkflowError::InvalidJob(format!(
                "job {} is {}, expected {}",
                job.id,
                job.status,
                JobStatus::Available
            )));
        }
        self.check_service(job)?;

        let driver_info = self.driver.export_record(job).await?;
        let mut document = serde_json::to_value(job)?;
        if let Some(fields) = document.as_object_mut() {
            fields.insert("driver_info".to_string(), driver_info);
        }

        Ok(ExportedRecord {
            service: job.service.clone().unwrap_or_else(|| self.driver.name().to_string()),
            url: BASE64.encode(serde_json::to_vec(&document)?),
        })
    }

    /// Import a record exported elsewhere into `job`, relaying to the next
    /// candidate host when this node runs a different driver.
    #[instrument(skip(self, ctx, job, url, candidate_hosts), fields(job_id = %job.id, request_id = %ctx.request_id()))]
    pub async fn import_record(
        &self,
        ctx: &RequestContext,
        job: Job,
        service: &str,
        url: &str,
        mut candidate_hosts: Vec<String>,
    ) -> Result<()> {
        if !self.router.service_matches(service, self.driver.as_ref()) {
            if candidate_hosts.is_empty() {
                return Err(WorkflowError::ServiceNotFound(format!(
                    "no candidate host runs {} to import job {}",
                    service, job.id
                )));
            }
            let next = candidate_hosts.remove(0);
            info!(next_host = %next, service = %service, "Relaying import to next candidate host");
            let rpc = self.rpc.as_ref().ok_or_else(|| {
                WorkflowError::RpcFailed("no RPC client to relay the import".to_string())
            })?;
            return rpc.import_record(ctx, &next, &job, service, url, candidate_hosts).await;
        }

        let _claim = self.claim(&job.id)?;
        let mut job = job;
        self.notify(ctx, "import", Phase::Start, &job);
        let result = self.import_record_inner(&mut job, url).await;
        self.report(ctx, "import", &job, &result);
        result
    }

    async fn import_record_inner(&self, job: &mut Job, url: &str) -> Result<()> {
        let fields = match decode_record(url) {
            Ok(fields) => fields,
            Err(e) => {
                self.fail_job(job, &e.to_string()).await;
                return Err(e);
            }
        };

        let missing: Vec<String> = REQUIRED_RECORD_FIELDS
            .iter()
            .filter(|name| fields.get(**name).map_or(true, serde_json::Value::is_null))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            let err = WorkflowError::MissingFields(missing);
            self.fail_job(job, &err.to_string()).await;
            return Err(err);
        }

        let record_id = fields
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if record_id != job.id {
            let err = WorkflowError::IdentityMismatch {
                expected: job.id.clone(),
                actual: record_id,
            };
            self.fail_job(job, &err.to_string()).await;
            return Err(err);
        }

        let driver_info = fields.get("driver_info").cloned().unwrap_or_default();
        let portable: PortableJob = match serde_json::from_value(serde_json::Value::Object(fields)) {
            Ok(portable) => portable,
            Err(e) => {
                let err = WorkflowError::InvalidJob(format!("malformed record: {}", e));
                self.fail_job(job, &err.to_string()).await;
                return Err(err);
            }
        };

        job.volume_id = portable.volume_id;
        job.size = portable.size;
        job.parent_id = portable.parent_id;
        job.project_id = portable.project_id.or(job.project_id.take());
        job.snapshot_id = portable.snapshot_id;

        if let Err(e) = self.driver.import_record(job, &driver_info).await {
            self.fail_job(job, &e.to_string()).await;
            return Err(e);
        }

        job.service = Some(self.driver.name().to_string());
        job.host = Some(self.config.host.clone());
        job.availability_zone = self.config.availability_zone.clone();
        job.override_status(JobStatus::Available, None);
        self.store.save_job(job).await?;
        info!("Record imported");

        if self.driver.supports_verify() {
            if let Err(e) = self.driver.verify(&job.id).await {
                error!(job_id = %job.id, error = %e, "Imported backup failed verification");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Operator override of a job's status.
    #[instrument(skip(self, ctx, job), fields(job_id = %job.id, request_id = %ctx.request_id()))]
    pub async fn reset_status(&self, ctx: &RequestContext, job: Job, status: JobStatus) -> Result<()> {
        let _claim = self.claim(&job.id)?;
        let mut job = self.refresh(&job).await?;
        self.notify(ctx, "reset_status", Phase::Start, &job);

        let result = self.reset_status_inner(ctx, &mut job, status).await;
        self.report(ctx, "reset_status", &job, &result);
        result
    }

    async fn reset_status_inner(&self, ctx: &RequestContext, job: &mut Job, status: JobStatus) -> Result<()> {
        self.check_service(job)?;

        match (status, job.status) {
            (JobStatus::Available, JobStatus::Restoring) => {
                job.override_status(JobStatus::Available, None);
            }
            (JobStatus::Available, _) => {
                if !self.driver.supports_verify() {
                    return Err(WorkflowError::UnsupportedOperation(format!(
                        "driver {} cannot verify job {} before resetting it to available",
                        self.driver.name(),
                        job.id
                    )));
                }
                self.driver.verify(&job.id).await?;
                job.override_status(JobStatus::Available, None);
            }
            (JobStatus::Error, _) => {
                job.override_status(JobStatus::Error, Some("reset by operator".to_string()));
            }
            (requested, current) => {
                info!(requested = %requested, current = %current, "Status reset is a no-op");
                self.cleanup_temp_resources(ctx, job).await?;
                return Ok(());
            }
        }

        self.store.save_job(job).await?;
        self.cleanup_temp_resources(ctx, job).await?;
        info!(status = %job.status, "Job status reset");
        Ok(())
    }

    /// Whether the local driver allows deleting jobs in non-terminal states.
    pub fn check_support_to_force_delete(&self) -> bool {
        self.driver.support_force_delete()
    }

    // =========================================================================
    // Data movement
    // =========================================================================

    /// Attach, stream through the driver, detach.
    ///
    /// Once the attach succeeds, detach runs exactly once whatever happens
    /// afterwards. The driver error wins over a detach error.
    async fn run_job(&self, ctx: &RequestContext, job: &mut Job, transfer: Transfer<'_>) -> Result<()> {
        let props = self.connectors.properties().clone();

        let device = match transfer {
            Transfer::Backup => {
                let device = self.volumes.get_backup_device(ctx, job).await?;
                if device.temp_volume_id.is_some() || device.temp_snapshot_id.is_some() {
                    job.temp_volume_id = device.temp_volume_id.clone();
                    job.temp_snapshot_id = device.temp_snapshot_id.clone();
                    self.store.save_job(job).await?;
                }
                device
            }
            Transfer::Restore { volume_id } => BackupDevice::volume(volume_id),
        };

        let attachment = self.attach_device(ctx, &device, &props).await?;
        let streamed = self.stream(job, &attachment, &device, &transfer).await;
        let detached = self.detach_device(ctx, &device, &attachment, &props).await;

        match (streamed, detached) {
            (Err(e), Err(detach_err)) => {
                warn!(error = %detach_err, "Detach failed after a failed transfer");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), detached) => detached,
        }
    }

    async fn stream(
        &self,
        job: &Job,
        attachment: &Attachment,
        device: &BackupDevice,
        transfer: &Transfer<'_>,
    ) -> Result<()> {
        let path = &attachment.device.path;
        let _owner = if device.secure_enabled {
            None
        } else {
            Some(TemporaryOwnership::acquire(path)?)
        };

        let mut options = OpenOptions::new();
        match transfer {
            Transfer::Backup => options.read(true),
            Transfer::Restore { .. } => options.write(true),
        };
        let mut file = options.open(path).await.map_err(|e| {
            WorkflowError::ConnectorFailed(format!("Failed to open {}: {}", path.display(), e))
        })?;

        match transfer {
            Transfer::Backup => self.driver.backup(job, &mut file).await,
            Transfer::Restore { volume_id } => self.driver.restore(job, volume_id, &mut file).await,
        }
    }

    async fn attach_device(
        &self,
        ctx: &RequestContext,
        device: &BackupDevice,
        props: &ConnectorProperties,
    ) -> Result<Attachment> {
        let conn = if device.is_snapshot {
            self.volumes
                .initialize_connection_snapshot(ctx, &device.device_id, props)
                .await?
        } else {
            self.volumes.initialize_connection(ctx, &device.device_id, props).await?
        };

        let connected = match self.connectors.connector_for(&conn.driver_volume_type) {
            Ok(connector) => connector.connect_volume(&conn).await,
            Err(e) => Err(e),
        };

        match connected {
            Ok(attached) => {
                debug!(device_id = %device.device_id, path = %attached.path.display(), "Device attached");
                Ok(Attachment { conn, device: attached })
            }
            Err(e) => {
                if let Err(term_err) = self.terminate(ctx, device, props, true).await {
                    error!(
                        device_id = %device.device_id,
                        error = %term_err,
                        "Forced terminate after failed attach also failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn detach_device(
        &self,
        ctx: &RequestContext,
        device: &BackupDevice,
        attachment: &Attachment,
        props: &ConnectorProperties,
    ) -> Result<()> {
        let disconnected = match self.connectors.connector_for(&attachment.device.protocol) {
            Ok(connector) => {
                connector
                    .disconnect_volume(&attachment.conn, &attachment.device, false)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = disconnected {
            warn!(device_id = %device.device_id, error = %e, "Disconnect failed, forcing terminate");
            if let Err(term_err) = self.terminate(ctx, device, props, true).await {
                error!(device_id = %device.device_id, error = %term_err, "Forced terminate failed");
            }
            return Err(e);
        }

        self.terminate(ctx, device, props, false).await?;
        if device.is_snapshot {
            self.volumes.remove_export_snapshot(ctx, &device.device_id).await?;
        } else {
            self.volumes.remove_export(ctx, &device.device_id).await?;
        }
        debug!(device_id = %device.device_id, "Device detached");
        Ok(())
    }

    async fn terminate(
        &self,
        ctx: &RequestContext,
        device: &BackupDevice,
        props: &ConnectorProperties,
        force: bool,
    ) -> Result<()> {
        if device.is_snapshot {
            self.volumes
                .terminate_connection_snapshot(ctx, &device.device_id, props, force)
                .await
        } else {
            self.volumes
                .terminate_connection(ctx, &device.device_id, props, force)
                .await
        }
    }
}

/// Decode an exported record URL into its JSON fields.
fn decode_record(url: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let bytes = BASE64
        .decode(url.trim())
        .map_err(|e| WorkflowError::InvalidJob(format!("record is not valid base64: {}", e)))?;
    match serde_json::from_slice(&bytes) {
        Ok(serde_json::Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(WorkflowError::InvalidJob("record is not a JSON object".to_string())),
        Err(e) => Err(WorkflowError::InvalidJob(format!("record is not valid JSON: {}", e))),
    }
}

/// Encode JSON fields the way `export_record` does.
pub fn encode_record(fields: &serde_json::Value) -> Result<String> {
    Ok(BASE64.encode(serde_json::to_vec(fields)?))
}
