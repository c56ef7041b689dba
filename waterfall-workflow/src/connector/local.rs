//! Local device connector.
//!
//! Used when the volume side already exposes the device on this host, so
//! "attaching" is only a matter of checking the path exists.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{AttachedDevice, ConnectionInfo, DeviceConnector};
use crate::error::{Result, WorkflowError};

/// Protocol name of the local connector.
pub const LOCAL_PROTOCOL: &str = "local";

/// Connector for devices that are already local.
pub struct LocalConnector;

impl LocalConnector {
    /// Create a local connector.
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceConnector for LocalConnector {
    fn protocol(&self) -> &str {
        LOCAL_PROTOCOL
    }

    #[instrument(skip(self, conn))]
    async fn connect_volume(&self, conn: &ConnectionInfo) -> Result<AttachedDevice> {
        let path = PathBuf::from(conn.require("device_path")?);

        if tokio::fs::metadata(&path).await.is_err() {
            return Err(WorkflowError::ConnectorFailed(format!(
                "local device {} does not exist",
                path.display()
            )));
        }

        debug!(path = %path.display(), "Local device present");
        Ok(AttachedDevice {
            path,
            protocol: LOCAL_PROTOCOL.to_string(),
        })
    }

    async fn disconnect_volume(
        &self,
        _conn: &ConnectionInfo,
        device: &AttachedDevice,
        _force: bool,
    ) -> Result<()> {
        debug!(path = %device.path.display(), "Nothing to release for local device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_existing_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = ConnectionInfo::new(LOCAL_PROTOCOL)
            .with("device_path", file.path().to_string_lossy());

        let connector = LocalConnector::new();
        let device = connector.connect_volume(&conn).await.unwrap();
        assert_eq!(device.path, file.path());
        connector.disconnect_volume(&conn, &device, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_missing_path() {
        let conn = ConnectionInfo::new(LOCAL_PROTOCOL).with("device_path", "/nonexistent/dev/xyz");
        let err = LocalConnector::new().connect_volume(&conn).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ConnectorFailed(_)));
    }
}
