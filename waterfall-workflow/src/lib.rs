//! # Waterfall Workflow
//!
//! Lifecycle manager for backup/restore jobs ("workflows").
//!
//! A job is driven through its state machine by the manager bound to the
//! backend that created it. The manager talks to its collaborators only
//! through traits:
//!
//! ```text
//!               ┌──────────────────────────┐
//!   RPC ───────►│     WorkflowManager      │◄──── HostRouter
//!               └────────────┬─────────────┘      (backend → driver)
//!        ┌─────────┬─────────┼──────────┬──────────────┐
//!        ▼         ▼         ▼          ▼              ▼
//!   ┌─────────┐┌────────┐┌────────┐┌─────────┐┌──────────────┐
//!   │JobStore ││ Volume ││ Quota  ││ Device  ││BackendDriver │
//!   │         ││Service ││ Ledger ││Connector││              │
//!   └─────────┘└────────┘└────────┘└─────────┘└──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use waterfall_workflow::*;
//!
//! let mut router = HostRouter::new();
//! router.register(DriverKind::Mock, "mock", Arc::new(MockDriver::new()))?;
//!
//! let manager = Arc::new(WorkflowManager::new(
//!     ManagerConfig::new("node1@mock"),
//!     Arc::new(router),
//!     deps,
//! )?);
//! manager.init_host(&RequestContext::admin()).await?;
//! ```

pub mod connector;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod events;
pub mod host;
pub mod manager;
pub mod mock;
pub mod quota;
pub mod rpc;
pub mod store;
pub mod types;
pub mod volume;

pub use connector::{
    AttachedDevice, ConnectionInfo, ConnectorProperties, ConnectorSet, DeviceConnector, IscsiConnector,
    LocalConnector, TemporaryOwnership, ISCSI_PROTOCOL, LOCAL_PROTOCOL,
};
pub use driver::{BackendDriver, DeviceIo, DriverKind};
pub use drivers::{SimpleDriver, DEFAULT_BACKUP_PATH};
pub use error::{ErrorKind, Result, WorkflowError};
pub use events::{Notification, NotificationStore, Notifier, Phase};
pub use host::{compose_host, extract_backend, HostRouter, ServiceMigrations};
pub use manager::{ManagerConfig, ManagerDeps, ReconcileSummary, WorkflowManager};
pub use mock::{MockConnector, MockDriver, MockVolumeService, MOCK_DRIVER_NAME, MOCK_PROTOCOL};
pub use quota::{MemoryQuotaLedger, QuotaDeltas, QuotaLedger, Reservation};
pub use rpc::{LocalTransport, RpcChannel, RpcEndpoint, RpcVersion, WorkflowDispatcher, WorkflowRpcClient};
pub use store::{JobStore, MemoryStore};
pub use types::*;
pub use volume::{BackupDevice, VolumeService};
