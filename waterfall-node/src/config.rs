//! Configuration management for the workflow node.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use waterfall_workflow::{DriverKind, RpcVersion, DEFAULT_BACKUP_PATH};

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,
    /// Lifecycle manager and driver settings
    pub workflow: WorkflowConfig,
    /// Inter-node messaging
    pub rpc: RpcConfig,
    /// Device attachment
    pub connector: ConnectorConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from YAML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Result<Self> {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if let Some(ref hostname) = args.hostname {
            self.node.hostname = Some(hostname.clone());
        }

        if let Some(ref backend) = args.backend {
            self.workflow.backend_name = backend.clone();
        }

        if let Some(ref path) = args.backup_path {
            self.workflow.backup_path = path.clone();
        }

        if let Some(ref cap) = args.rpc_version_cap {
            let cap: RpcVersion = cap
                .parse()
                .with_context(|| format!("Invalid RPC version cap: {}", cap))?;
            self.rpc.version_cap = Some(cap);
        }

        if args.offload_deletes {
            self.workflow.offload_deletes = true;
        }

        if args.dev {
            self.workflow.driver = DriverKind::Mock;
            self.workflow.backend_name = "mock".to_string();
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.workflow.backend_name.is_empty() || self.workflow.backend_name.contains('@') {
            return Err(anyhow::anyhow!(
                "Invalid backend name: '{}'",
                self.workflow.backend_name
            ));
        }
        if self.workflow.max_concurrent_operations == 0 {
            return Err(anyhow::anyhow!("max_concurrent_operations must be at least 1"));
        }
        if self.workflow.maintenance_interval_secs == 0 {
            return Err(anyhow::anyhow!("maintenance_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

/// Node identity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname (auto-detected if not set)
    pub hostname: Option<String>,
    /// Availability zone recorded on jobs created here
    pub availability_zone: Option<String>,
}

impl NodeConfig {
    /// Get the hostname, detecting it if not set.
    pub fn get_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Lifecycle manager and driver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Backend driver
    pub driver: DriverKind,
    /// Backend name served by this node
    pub backend_name: String,
    /// Directory for the simple driver
    pub backup_path: String,
    /// Resume interrupted deletes in the background
    pub offload_deletes: bool,
    /// Bound on concurrent background deletes
    pub max_concurrent_operations: usize,
    /// Accept jobs recorded under retired driver names
    pub legacy_service_compat: bool,
    /// Seconds between leaked-resource sweeps
    pub maintenance_interval_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Simple,
            backend_name: "simple".to_string(),
            backup_path: DEFAULT_BACKUP_PATH.to_string(),
            offload_deletes: false,
            max_concurrent_operations: 4,
            legacy_service_compat: true,
            maintenance_interval_secs: 60,
        }
    }
}

/// Inter-node messaging.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Never send messages above this version
    pub version_cap: Option<RpcVersion>,
    /// Accept messages from peers still on the 1.x protocol
    pub accept_legacy: bool,
    /// Timeout for calls that wait for a reply
    pub call_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            version_cap: None,
            accept_legacy: true,
            call_timeout_secs: 60,
        }
    }
}

/// Device attachment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Protocol used to reach devices handed out by the volume service
    pub protocol: ConnectorProtocol,
    /// Path to the iscsiadm binary
    pub iscsiadm_path: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            protocol: ConnectorProtocol::Local,
            iscsiadm_path: "iscsiadm".to_string(),
        }
    }
}

/// Device attachment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorProtocol {
    /// Devices already present on this host
    #[default]
    Local,
    /// iSCSI targets logged in with iscsiadm
    Iscsi,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["waterfall-node"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.workflow.driver, DriverKind::Simple);
        assert_eq!(config.workflow.backend_name, "simple");
        assert_eq!(config.workflow.maintenance_interval_secs, 60);
        assert_eq!(config.rpc.call_timeout_secs, 60);
        assert!(config.rpc.version_cap.is_none());
        assert_eq!(config.connector.protocol, ConnectorProtocol::Local);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = Config::parse(
            r#"
node:
  hostname: node1
  availability_zone: az-1
workflow:
  driver: mock
  backend_name: fast
  offload_deletes: true
rpc:
  version_cap: "1.3"
connector:
  protocol: iscsi
"#,
        )
        .unwrap();

        assert_eq!(config.node.get_hostname(), "node1");
        assert_eq!(config.node.availability_zone.as_deref(), Some("az-1"));
        assert_eq!(config.workflow.driver, DriverKind::Mock);
        assert_eq!(config.workflow.backend_name, "fast");
        assert!(config.workflow.offload_deletes);
        assert_eq!(config.workflow.max_concurrent_operations, 4);
        assert_eq!(config.rpc.version_cap, Some(RpcVersion::V1_3));
        assert_eq!(config.connector.protocol, ConnectorProtocol::Iscsi);
        assert_eq!(config.connector.iscsiadm_path, "iscsiadm");
    }

    #[test]
    fn test_invalid_backend_rejected() {
        assert!(Config::parse("workflow:\n  backend_name: a@b\n").is_err());
        assert!(Config::parse("rpc:\n  version_cap: banana\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workflow:\n  maintenance_interval_secs: 5").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.workflow.maintenance_interval_secs, 5);
        assert!(Config::load("/nonexistent/waterfall.yaml").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::default()
            .with_cli_overrides(&args(&["--hostname", "node7", "--rpc-version-cap", "1.1", "--dev"]))
            .unwrap();
        assert_eq!(config.node.hostname.as_deref(), Some("node7"));
        assert_eq!(config.rpc.version_cap, Some(RpcVersion::V1_1));
        assert_eq!(config.workflow.driver, DriverKind::Mock);
        assert_eq!(config.workflow.backend_name, "mock");

        assert!(Config::default_with_cli(&args(&["--rpc-version-cap", "x.y"])).is_err());
    }
}
