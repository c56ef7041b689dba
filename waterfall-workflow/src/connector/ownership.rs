//! Temporary ownership of an attached device node.

use std::os::unix::fs::{chown, MetadataExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, WorkflowError};

/// Guard that hands a device node to the effective user and gives it
/// back to its original owner when dropped.
#[derive(Debug)]
pub struct TemporaryOwnership {
    path: PathBuf,
    /// Original uid, `None` when no change was needed
    original_uid: Option<u32>,
}

impl TemporaryOwnership {
    /// Take ownership of `path` if the effective user does not own it yet.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            WorkflowError::ConnectorFailed(format!("Failed to stat {}: {}", path.display(), e))
        })?;

        let owner = metadata.uid();
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };

        if owner == euid {
            return Ok(Self { path, original_uid: None });
        }

        chown(&path, Some(euid), None).map_err(|e| {
            WorkflowError::ConnectorFailed(format!("Failed to chown {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), from = owner, to = euid, "Took temporary ownership");

        Ok(Self {
            path,
            original_uid: Some(owner),
        })
    }

    /// Whether ownership was actually changed.
    pub fn changed(&self) -> bool {
        self.original_uid.is_some()
    }
}

impl Drop for TemporaryOwnership {
    fn drop(&mut self) {
        if let Some(uid) = self.original_uid {
            match chown(&self.path, Some(uid), None) {
                Ok(()) => debug!(path = %self.path.display(), uid, "Restored ownership"),
                Err(e) => warn!(path = %self.path.display(), uid, error = %e, "Failed to restore ownership"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_file_needs_no_change() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let guard = TemporaryOwnership::acquire(file.path()).unwrap();
        assert!(!guard.changed());
    }

    #[test]
    fn test_missing_path_fails() {
        assert!(TemporaryOwnership::acquire("/nonexistent/device").is_err());
    }
}
