//! iSCSI device connector.
//!
//! Logs in to the target named in the connection info via `iscsiadm` and
//! waits for the by-path device node to appear.
//!
//! ## Prerequisites
//! - `open-iscsi` package installed
//! - iSCSI target reachable from the node

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use super::{AttachedDevice, ConnectionInfo, DeviceConnector};
use crate::error::{Result, WorkflowError};

/// Protocol name of the iSCSI connector.
pub const ISCSI_PROTOCOL: &str = "iscsi";

/// Default number of times to look for the device after login.
const DEFAULT_DEVICE_SCAN_ATTEMPTS: u32 = 5;

/// Target coordinates parsed from connection info.
#[derive(Debug, Clone, PartialEq)]
struct IscsiTarget {
    /// Portal address (e.g., "192.168.1.50:3260")
    portal: String,
    /// Target IQN
    iqn: String,
    /// LUN
    lun: u32,
}

impl IscsiTarget {
    fn from_conn(conn: &ConnectionInfo) -> Result<Self> {
        let lun = conn
            .data
            .get("target_lun")
            .map(|l| {
                l.parse::<u32>().map_err(|_| {
                    WorkflowError::ConnectorFailed(format!("invalid target_lun '{}'", l))
                })
            })
            .transpose()?
            .unwrap_or(0);

        Ok(Self {
            portal: conn.require("target_portal")?.to_string(),
            iqn: conn.require("target_iqn")?.to_string(),
            lun,
        })
    }

    /// Stable device path udev creates for the session.
    fn by_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}",
            self.portal, self.iqn, self.lun
        ))
    }
}

/// iSCSI connector.
pub struct IscsiConnector {
    /// iscsiadm binary path
    iscsiadm_path: String,
    /// Attempts to find the device after login
    scan_attempts: u32,
    /// Delay between attempts
    scan_interval: Duration,
}

impl IscsiConnector {
    /// Create a connector with default settings.
    pub fn new() -> Self {
        Self {
            iscsiadm_path: "iscsiadm".to_string(),
            scan_attempts: DEFAULT_DEVICE_SCAN_ATTEMPTS,
            scan_interval: Duration::from_secs(2),
        }
    }

    /// Set the iscsiadm binary path.
    pub fn with_iscsiadm(mut self, path: impl Into<String>) -> Self {
        self.iscsiadm_path = path.into();
        self
    }

    /// Run iscsiadm and return stdout.
    async fn run_iscsiadm(&self, args: &[&str]) -> Result<String> {
        debug!(command = %self.iscsiadm_path, args = ?args, "Executing command");

        let output = Command::new(&self.iscsiadm_path)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                WorkflowError::ConnectorFailed(format!("Failed to execute {}: {}", self.iscsiadm_path, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(command = %self.iscsiadm_path, stderr = %stderr, "Command failed");
            return Err(WorkflowError::ConnectorFailed(format!(
                "{} failed: {}",
                self.iscsiadm_path, stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Wait for the by-path device and resolve it to the real node.
    async fn find_device(&self, target: &IscsiTarget) -> Result<PathBuf> {
        let by_path = target.by_path();

        for attempt in 1..=self.scan_attempts {
            if let Ok(resolved) = tokio::fs::canonicalize(&by_path).await {
                info!(device = %resolved.display(), attempt, "Found iSCSI device");
                return Ok(resolved);
            }
            debug!(path = %by_path.display(), attempt, "iSCSI device not there yet");
            tokio::time::sleep(self.scan_interval).await;
        }

        Err(WorkflowError::ConnectorFailed(format!(
            "iSCSI device {} did not appear",
            by_path.display()
        )))
    }
}

impl Default for IscsiConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceConnector for IscsiConnector {
    fn protocol(&self) -> &str {
        ISCSI_PROTOCOL
    }

    #[instrument(skip(self, conn))]
    async fn connect_volume(&self, conn: &ConnectionInfo) -> Result<AttachedDevice> {
        let target = IscsiTarget::from_conn(conn)?;
        info!(portal = %target.portal, iqn = %target.iqn, "Logging into iSCSI target");

        self.run_iscsiadm(&["-m", "node", "-T", &target.iqn, "-p", &target.portal, "--op", "new"])
            .await?;
        self.run_iscsiadm(&["-m", "node", "-T", &target.iqn, "-p", &target.portal, "--login"])
            .await?;

        let path = self.find_device(&target).await?;
        Ok(AttachedDevice {
            path,
            protocol: ISCSI_PROTOCOL.to_string(),
        })
    }

    #[instrument(skip(self, conn, device), fields(device = %device.path.display()))]
    async fn disconnect_volume(
        &self,
        conn: &ConnectionInfo,
        device: &AttachedDevice,
        force: bool,
    ) -> Result<()> {
        let target = IscsiTarget::from_conn(conn)?;
        info!(iqn = %target.iqn, force, "Logging out from iSCSI target");

        let result = self
            .run_iscsiadm(&["-m", "node", "-T", &target.iqn, "-p", &target.portal, "--logout"])
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if force => {
                warn!(error = %e, "Logout failed, ignoring because of force");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionInfo {
        ConnectionInfo::new(ISCSI_PROTOCOL)
            .with("target_portal", "192.168.1.50:3260")
            .with("target_iqn", "iqn.2024-01.org.waterfall:vol-1")
            .with("target_lun", "1")
    }

    #[test]
    fn test_target_by_path() {
        let target = IscsiTarget::from_conn(&conn()).unwrap();
        assert_eq!(
            target.by_path(),
            PathBuf::from("/dev/disk/by-path/ip-192.168.1.50:3260-iscsi-iqn.2024-01.org.waterfall:vol-1-lun-1")
        );
    }

    #[test]
    fn test_target_rejects_bad_lun() {
        let conn = conn().with("target_lun", "one");
        assert!(IscsiTarget::from_conn(&conn).is_err());
    }

    #[tokio::test]
    async fn test_forced_disconnect_tolerates_missing_iscsiadm() {
        let connector = IscsiConnector::new().with_iscsiadm("/nonexistent/iscsiadm");
        let device = AttachedDevice {
            path: PathBuf::from("/dev/sdz"),
            protocol: ISCSI_PROTOCOL.to_string(),
        };

        assert!(connector.disconnect_volume(&conn(), &device, false).await.is_err());
        assert!(connector.disconnect_volume(&conn(), &device, true).await.is_ok());
    }
}
