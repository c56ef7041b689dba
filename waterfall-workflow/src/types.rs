//! Job, volume and request-context types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

// =============================================================================
// Job status
// =============================================================================

/// Lifecycle status of a job. This set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Backup is being taken.
    Creating,
    /// Backup data is complete and usable.
    Available,
    /// Backup data is being written to a volume.
    Restoring,
    /// Driver-level deletion is pending or running.
    Deleting,
    /// Unrecoverable failure; see `fail_reason`.
    Error,
    /// Failed restore. Only ever assigned on the volume side.
    ErrorRestoring,
}

impl JobStatus {
    /// All members of the status set.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Creating,
        JobStatus::Available,
        JobStatus::Restoring,
        JobStatus::Deleting,
        JobStatus::Error,
        JobStatus::ErrorRestoring,
    ];

    /// String form used in records and messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Creating => "creating",
            JobStatus::Available => "available",
            JobStatus::Restoring => "restoring",
            JobStatus::Deleting => "deleting",
            JobStatus::Error => "error",
            JobStatus::ErrorRestoring => "error_restoring",
        }
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (*self, next) {
            (_, Error) => true,
            (Creating, Available) => true,
            (Available, Restoring) => true,
            (Restoring, Available) => true,
            (Available | Error, Deleting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| WorkflowError::InvalidStatus(s.to_string()))
    }
}

// =============================================================================
// Job
// =============================================================================

/// A backup/restore job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, immutable after creation
    pub id: String,
    /// Source volume of the backup
    pub volume_id: String,
    /// Job this one is incremental from
    pub parent_id: Option<String>,
    /// Owning project, used for quota accounting
    pub project_id: Option<String>,
    /// Snapshot to back up instead of the live volume
    pub snapshot_id: Option<String>,
    /// Composite `hostname@backend` string, set once when claimed
    pub host: Option<String>,
    /// Driver name that created the backup data
    pub service: Option<String>,
    /// Availability zone of the claiming host
    pub availability_zone: Option<String>,
    /// Lifecycle status
    pub status: JobStatus,
    /// Reason for the last transition to error
    pub fail_reason: Option<String>,
    /// Size in GB, copied from the source volume on success
    pub size: u64,
    /// Scratch volume created for an in-flight operation
    pub temp_volume_id: Option<String>,
    /// Scratch snapshot created for an in-flight operation
    pub temp_snapshot_id: Option<String>,
    /// Target volume of an in-flight restore
    pub restore_volume_id: Option<String>,
    /// Number of jobs using this one as `parent_id`
    pub num_dependent_workflows: u32,
    /// Soft-delete flag
    pub deleted: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job in `creating` state for the given volume.
    pub fn new(volume_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            volume_id: volume_id.into(),
            parent_id: None,
            project_id: None,
            snapshot_id: None,
            host: None,
            service: None,
            availability_zone: None,
            status: JobStatus::Creating,
            fail_reason: None,
            size: 0,
            temp_volume_id: None,
            temp_snapshot_id: None,
            restore_volume_id: None,
            num_dependent_workflows: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the job ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the owning project.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Make this job incremental from `parent_id`.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether other jobs are incremental from this one.
    pub fn has_dependent_workflows(&self) -> bool {
        self.num_dependent_workflows > 0
    }

    /// Whether any scratch resource reference is set.
    pub fn has_temp_resources(&self) -> bool {
        self.temp_volume_id.is_some() || self.temp_snapshot_id.is_some()
    }

    /// Move along a state machine edge.
    ///
    /// Entering `error` records `reason`; any other edge clears a stale reason.
    pub fn transition(&mut self, next: JobStatus, reason: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidJob(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.override_status(next, reason);
        Ok(())
    }

    /// Set the status without the edge check (operator reset, record import).
    pub fn override_status(&mut self, next: JobStatus, reason: Option<String>) {
        self.status = next;
        self.fail_reason = if next == JobStatus::Error { reason } else { None };
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Volume
// =============================================================================

/// Status of a volume.
///
/// Volume status is shared with other subsystems, so unknown values are
/// carried through unchanged in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VolumeStatus {
    Available,
    InUse,
    BackingUp,
    RestoringWorkflow,
    Error,
    ErrorBackingUp,
    ErrorRestoring,
    Other(String),
}

impl VolumeStatus {
    /// String form used in records.
    pub fn as_str(&self) -> &str {
        match self {
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::BackingUp => "backing-up",
            VolumeStatus::RestoringWorkflow => "restoring-workflow",
            VolumeStatus::Error => "error",
            VolumeStatus::ErrorBackingUp => "error_backing-up",
            VolumeStatus::ErrorRestoring => "error_restoring",
            VolumeStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for VolumeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "available" => VolumeStatus::Available,
            "in-use" => VolumeStatus::InUse,
            "backing-up" => VolumeStatus::BackingUp,
            "restoring-workflow" => VolumeStatus::RestoringWorkflow,
            "error" => VolumeStatus::Error,
            "error_backing-up" => VolumeStatus::ErrorBackingUp,
            "error_restoring" => VolumeStatus::ErrorRestoring,
            _ => VolumeStatus::Other(s),
        }
    }
}

impl From<&str> for VolumeStatus {
    fn from(s: &str) -> Self {
        VolumeStatus::from(s.to_string())
    }
}

impl From<VolumeStatus> for String {
    fn from(status: VolumeStatus) -> Self {
        status.as_str().to_string()
    }
}

/// An attachment of a volume to a host or instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    /// Attachment ID
    pub id: String,
    /// Guest instance, `None` for host-side attachments made by a backup
    pub instance_uuid: Option<String>,
    /// Host the volume is attached to
    pub attached_host: Option<String>,
}

/// A volume record. Owned by the volume subsystem, referenced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume ID
    pub id: String,
    /// Current status
    pub status: VolumeStatus,
    /// Status before entering a backup-specific state
    pub previous_status: Option<VolumeStatus>,
    /// Size in GB
    pub size: u64,
    /// Host the volume lives on
    pub host: Option<String>,
    /// Owning project
    pub project_id: Option<String>,
    /// Active attachments
    pub attachments: Vec<VolumeAttachment>,
}

impl Volume {
    /// Create a volume record.
    pub fn new(id: impl Into<String>, size: u64, status: VolumeStatus) -> Self {
        Self {
            id: id.into(),
            status,
            previous_status: None,
            size,
            host: None,
            project_id: None,
            attachments: Vec::new(),
        }
    }

    /// Set the status recorded before the backup-specific state.
    pub fn with_previous_status(mut self, status: VolumeStatus) -> Self {
        self.previous_status = Some(status);
        self
    }

    /// Attachments made by a backup on `host` rather than by a guest.
    pub fn backup_attachments_on<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a VolumeAttachment> + 'a {
        self.attachments.iter().filter(move |a| {
            a.instance_uuid.is_none() && a.attached_host.as_deref() == Some(host)
        })
    }
}

// =============================================================================
// Request context and exported records
// =============================================================================

/// Per-request context passed through every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation ID. Omitted when talking to 1.x peers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Project the request acts for
    pub project_id: Option<String>,
    /// User issuing the request
    pub user_id: Option<String>,
    /// Operator privileges
    pub is_admin: bool,
}

impl RequestContext {
    /// Create a context for a project with a fresh request ID.
    pub fn new(project_id: Option<String>) -> Self {
        Self {
            request_id: Some(format!("req-{}", uuid::Uuid::new_v4())),
            project_id,
            user_id: None,
            is_admin: false,
        }
    }

    /// An operator context used for internal work such as reconciliation.
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::new(None)
        }
    }

    /// Correlation ID for logging, `-` when absent.
    pub fn request_id(&self) -> &str {
        self.request_id.as_deref().unwrap_or("-")
    }
}

/// A portable backup record produced by `export_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedRecord {
    /// Driver name that must import the record
    pub service: String,
    /// Encoded job and driver information
    pub url: String,
}
