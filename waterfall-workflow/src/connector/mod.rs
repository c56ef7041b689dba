//! Device connectors.
//!
//! A connector turns the connection info handed out by the volume side
//! into a local device path, and releases it again:
//! - **local**: the device is already present on this host
//! - **iscsi**: log in to an iSCSI target and find its by-path device
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ConnectorSet                  │
//! │  - host connector properties                 │
//! │  - routes by connection protocol             │
//! └───────────────────────┬──────────────────────┘
//!               ┌─────────┴─────────┐
//!               ▼                   ▼
//!        ┌────────────┐      ┌────────────┐
//!        │   Local    │      │   iSCSI    │
//!        │ Connector  │      │ Connector  │
//!        └────────────┘      └────────────┘
//! ```

mod iscsi;
mod local;
mod ownership;

pub use iscsi::*;
pub use local::*;
pub use ownership::TemporaryOwnership;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WorkflowError};

/// Properties of this host's initiator, sent to the volume side when a
/// connection is initialised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorProperties {
    /// Host name
    pub host: String,
    /// iSCSI initiator name, if one is configured
    pub initiator: Option<String>,
    /// Management IP
    pub ip: Option<String>,
    /// Whether multipath is enabled
    pub multipath: bool,
}

impl ConnectorProperties {
    /// Properties for a host without an initiator.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            initiator: None,
            ip: None,
            multipath: false,
        }
    }
}

/// Connection info returned by the volume side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Protocol, e.g. "local" or "iscsi"
    pub driver_volume_type: String,
    /// Protocol-specific data
    pub data: HashMap<String, String>,
}

impl ConnectionInfo {
    /// Create connection info for a protocol.
    pub fn new(driver_volume_type: impl Into<String>) -> Self {
        Self {
            driver_volume_type: driver_volume_type.into(),
            data: HashMap::new(),
        }
    }

    /// Add a data entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Required data entry.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.data.get(key).map(String::as_str).ok_or_else(|| {
            WorkflowError::ConnectorFailed(format!(
                "{} connection info is missing '{}'",
                self.driver_volume_type, key
            ))
        })
    }
}

/// A device attached to this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedDevice {
    /// Local path for raw I/O
    pub path: PathBuf,
    /// Protocol used to attach it
    pub protocol: String,
}

/// Connector trait - implemented once per attach protocol.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Protocol name this connector handles.
    fn protocol(&self) -> &str;

    /// Attach the device described by `conn` to this host.
    async fn connect_volume(&self, conn: &ConnectionInfo) -> Result<AttachedDevice>;

    /// Release a device attached by `connect_volume`.
    ///
    /// With `force`, failures that leave the device half-released are
    /// tolerated where the protocol allows it.
    async fn disconnect_volume(
        &self,
        conn: &ConnectionInfo,
        device: &AttachedDevice,
        force: bool,
    ) -> Result<()>;
}

/// Connectors available on this host, by protocol.
pub struct ConnectorSet {
    properties: ConnectorProperties,
    connectors: HashMap<String, Arc<dyn DeviceConnector>>,
}

impl ConnectorSet {
    /// Create an empty set for a host.
    pub fn new(properties: ConnectorProperties) -> Self {
        Self {
            properties,
            connectors: HashMap::new(),
        }
    }

    /// Register a connector under its protocol name.
    pub fn register(&mut self, connector: Arc<dyn DeviceConnector>) {
        info!(protocol = %connector.protocol(), "Registered device connector");
        self.connectors
            .insert(connector.protocol().to_string(), connector);
    }

    /// Add a connector, builder style.
    pub fn with(mut self, connector: Arc<dyn DeviceConnector>) -> Self {
        self.register(connector);
        self
    }

    /// Connector properties of this host.
    pub fn properties(&self) -> &ConnectorProperties {
        &self.properties
    }

    /// Connector for a protocol.
    pub fn connector_for(&self, protocol: &str) -> Result<Arc<dyn DeviceConnector>> {
        self.connectors.get(protocol).cloned().ok_or_else(|| {
            WorkflowError::ConnectorFailed(format!("no connector for protocol '{}'", protocol))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_set_routes_by_protocol() {
        let set = ConnectorSet::new(ConnectorProperties::for_host("node1"))
            .with(Arc::new(LocalConnector::new()));

        assert_eq!(set.connector_for("local").unwrap().protocol(), "local");
        assert!(set.connector_for("iscsi").is_err());
        assert_eq!(set.properties().host, "node1");
    }

    #[test]
    fn test_connection_info_require() {
        let conn = ConnectionInfo::new("iscsi").with("target_portal", "10.0.0.5:3260");
        assert_eq!(conn.require("target_portal").unwrap(), "10.0.0.5:3260");
        assert!(conn.require("target_iqn").is_err());
    }
}
