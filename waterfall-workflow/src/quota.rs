//! Quota ledger interface and in-memory implementation.
//!
//! Reservations are taken before a state-changing operation and committed
//! only after it succeeds, or rolled back.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{Result, WorkflowError};

/// Resource counter deltas for one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDeltas {
    /// Change in job count
    pub jobs: i64,
    /// Change in stored gigabytes
    pub gigabytes: i64,
}

impl QuotaDeltas {
    /// Deltas that release one job of `size` gigabytes.
    pub fn release(size: u64) -> Self {
        Self {
            jobs: -1,
            gigabytes: -i64::try_from(size).unwrap_or(i64::MAX),
        }
    }
}

/// Handle to a pending reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID
    pub id: String,
    /// Project the reservation belongs to
    pub project_id: String,
}

/// Quota ledger trait.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Reserve `deltas` for `project_id`.
    async fn reserve(&self, project_id: &str, deltas: QuotaDeltas) -> Result<Reservation>;

    /// Apply a reservation to the project's usage.
    async fn commit(&self, reservation: &Reservation) -> Result<()>;

    /// Drop a reservation without applying it.
    async fn rollback(&self, reservation: &Reservation) -> Result<()>;
}

/// Usage of one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectUsage {
    /// Committed job count
    pub jobs: i64,
    /// Committed gigabytes
    pub gigabytes: i64,
}

#[derive(Default)]
struct LedgerState {
    usage: HashMap<String, ProjectUsage>,
    pending: HashMap<String, (String, QuotaDeltas)>,
    committed: u64,
    rolled_back: u64,
}

/// In-memory quota ledger.
#[derive(Default)]
pub struct MemoryQuotaLedger {
    state: Mutex<LedgerState>,
}

impl MemoryQuotaLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| WorkflowError::Internal("Lock poisoned".to_string()))
    }

    /// Set a project's current usage.
    pub fn set_usage(&self, project_id: &str, usage: ProjectUsage) -> Result<()> {
        self.lock()?.usage.insert(project_id.to_string(), usage);
        Ok(())
    }

    /// Committed usage of a project.
    pub fn usage(&self, project_id: &str) -> Result<ProjectUsage> {
        Ok(self.lock()?.usage.get(project_id).copied().unwrap_or_default())
    }

    /// Number of reservations neither committed nor rolled back.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// Number of commits so far.
    pub fn committed_count(&self) -> Result<u64> {
        Ok(self.lock()?.committed)
    }

    /// Number of rollbacks so far.
    pub fn rolled_back_count(&self) -> Result<u64> {
        Ok(self.lock()?.rolled_back)
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    #[instrument(skip(self))]
    async fn reserve(&self, project_id: &str, deltas: QuotaDeltas) -> Result<Reservation> {
        let reservation = Reservation {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
        };
        self.lock()?
            .pending
            .insert(reservation.id.clone(), (project_id.to_string(), deltas));
        debug!(reservation_id = %reservation.id, "Quota reserved");
        Ok(reservation)
    }

    #[instrument(skip(self), fields(reservation_id = %reservation.id))]
    async fn commit(&self, reservation: &Reservation) -> Result<()> {
        let mut state = self.lock()?;
        let (project_id, deltas) = state.pending.remove(&reservation.id).ok_or_else(|| {
            WorkflowError::QuotaFailed(format!("reservation {} is not pending", reservation.id))
        })?;

        let usage = state.usage.entry(project_id).or_default();
        usage.jobs = (usage.jobs + deltas.jobs).max(0);
        usage.gigabytes = (usage.gigabytes + deltas.gigabytes).max(0);
        state.committed += 1;

        info!(jobs = deltas.jobs, gigabytes = deltas.gigabytes, "Quota committed");
        Ok(())
    }

    #[instrument(skip(self), fields(reservation_id = %reservation.id))]
    async fn rollback(&self, reservation: &Reservation) -> Result<()> {
        let mut state = self.lock()?;
        if state.pending.remove(&reservation.id).is_none() {
            return Err(WorkflowError::QuotaFailed(format!(
                "reservation {} is not pending",
                reservation.id
            )));
        }
        state.rolled_back += 1;
        debug!("Quota reservation rolled back");
        Ok(())
    }
}
