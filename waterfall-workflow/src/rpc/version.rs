//! Workflow RPC protocol versions.
//!
//! Version history:
//!
//! - 1.0: initial version.
//! - 1.1: methods take job objects instead of IDs.
//! - 1.3: marks the workflow service running decoupled from the volume
//!   service. Changes to 1.x methods after this point must work with a
//!   version cap of 1.3.
//! - 2.0: drops 1.x compatibility. Request contexts carry a `request_id`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

/// A `major.minor` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RpcVersion {
    pub major: u32,
    pub minor: u32,
}

impl RpcVersion {
    pub const V1_0: RpcVersion = RpcVersion::new(1, 0);
    pub const V1_1: RpcVersion = RpcVersion::new(1, 1);
    pub const V1_3: RpcVersion = RpcVersion::new(1, 3);
    pub const V2_0: RpcVersion = RpcVersion::new(2, 0);

    /// Version spoken by this release.
    pub const CURRENT: RpcVersion = RpcVersion::V2_0;

    /// Version clients fall back to for 1.x peers.
    pub const LEGACY: RpcVersion = RpcVersion::V1_1;

    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether a server speaking `self` understands a message sent at
    /// `requested`. Minor versions are backwards compatible, majors are not.
    pub fn can_accept(&self, requested: RpcVersion) -> bool {
        self.major == requested.major && requested.minor <= self.minor
    }

    /// Whether messages at this version carry the request correlation ID.
    pub fn carries_request_id(&self) -> bool {
        self.major >= 2
    }
}

impl fmt::Display for RpcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for RpcVersion {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WorkflowError::InvalidConfig(format!("invalid RPC version '{}'", s));
        let (major, minor) = s.trim().split_once('.').unwrap_or((s.trim(), "0"));
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for RpcVersion {
    type Error = WorkflowError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RpcVersion> for String {
    fn from(v: RpcVersion) -> Self {
        v.to_string()
    }
}
