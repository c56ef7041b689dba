//! RPC channel trait and the in-process transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::message::{RpcEnvelope, WorkflowReply};
use super::version::RpcVersion;
use crate::error::{Result, WorkflowError};

/// Default timeout for `call`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Server side of a channel.
#[async_trait]
pub trait RpcEndpoint: Send + Sync {
    /// Highest version this endpoint understands.
    fn max_version(&self) -> RpcVersion;

    /// Handle one request.
    async fn dispatch(&self, envelope: RpcEnvelope) -> Result<WorkflowReply>;
}

/// Messaging between nodes.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Whether a message at `version` may be sent to `server`, given the
    /// configured version cap and what the server advertises.
    fn can_send_version(&self, server: &str, version: RpcVersion) -> bool;

    /// Fire-and-forget send.
    async fn cast(&self, server: &str, envelope: RpcEnvelope) -> Result<()>;

    /// Send and wait for the reply, bounded by the channel's timeout.
    async fn call(&self, server: &str, envelope: RpcEnvelope) -> Result<WorkflowReply>;
}

/// In-process transport routing envelopes to registered endpoints by
/// server name.
pub struct LocalTransport {
    endpoints: RwLock<HashMap<String, Arc<dyn RpcEndpoint>>>,
    version_cap: Option<RpcVersion>,
    call_timeout: Duration,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalTransport {
    /// Create a transport without a version cap.
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            version_cap: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Never send above `cap`, as during a rolling upgrade.
    pub fn with_version_cap(mut self, cap: RpcVersion) -> Self {
        self.version_cap = Some(cap);
        self
    }

    /// Set the `call` timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Configured version cap.
    pub fn version_cap(&self) -> Option<RpcVersion> {
        self.version_cap
    }

    /// Start delivering messages for `server` to `endpoint`.
    pub fn register(&self, server: impl Into<String>, endpoint: Arc<dyn RpcEndpoint>) -> Result<()> {
        let server = server.into();
        let mut endpoints = self
            .endpoints
            .write()
            .map_err(|_| WorkflowError::Internal("Lock poisoned".to_string()))?;
        info!(server = %server, max_version = %endpoint.max_version(), "RPC endpoint registered");
        endpoints.insert(server, endpoint);
        Ok(())
    }

    /// Stop delivering messages for `server`.
    pub fn unregister(&self, server: &str) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            if endpoints.remove(server).is_some() {
                info!(server = %server, "RPC endpoint unregistered");
            }
        }
    }

    /// Wait for every cast sent so far to finish.
    pub async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = match self.in_flight.lock() {
                Ok(mut in_flight) => std::mem::take(&mut *in_flight),
                Err(_) => return,
            };
            if handles.is_empty() {
                return;
            }
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "RPC cast task panicked");
                }
            }
        }
    }

    fn endpoint(&self, server: &str) -> Result<Arc<dyn RpcEndpoint>> {
        let endpoints = self
            .endpoints
            .read()
            .map_err(|_| WorkflowError::Internal("Lock poisoned".to_string()))?;
        endpoints
            .get(server)
            .cloned()
            .ok_or_else(|| WorkflowError::RpcFailed(format!("no server listening as {}", server)))
    }

    fn check_version(&self, server: &str, version: RpcVersion) -> Result<()> {
        if self.can_send_version(server, version) {
            return Ok(());
        }
        let supported = match (self.version_cap, self.endpoint(server).ok()) {
            (Some(cap), _) if version > cap => cap,
            (_, Some(endpoint)) => endpoint.max_version(),
            _ => RpcVersion::CURRENT,
        };
        Err(WorkflowError::VersionUnsupported {
            requested: version.to_string(),
            supported: supported.to_string(),
        })
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcChannel for LocalTransport {
    fn can_send_version(&self, server: &str, version: RpcVersion) -> bool {
        if self.version_cap.map_or(false, |cap| version > cap) {
            return false;
        }
        match self.endpoint(server) {
            Ok(endpoint) => endpoint.max_version().can_accept(version),
            Err(_) => true,
        }
    }

    async fn cast(&self, server: &str, envelope: RpcEnvelope) -> Result<()> {
        self.check_version(server, envelope.version)?;
        let endpoint = self.endpoint(server)?;
        let method = envelope.request.method();
        debug!(server = %server, method, version = %envelope.version, "RPC cast");

        let server = server.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = endpoint.dispatch(envelope).await {
                warn!(server = %server, method, error = %e, "RPC cast failed on server");
            }
        });

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle);
        }
        Ok(())
    }

    async fn call(&self, server: &str, envelope: RpcEnvelope) -> Result<WorkflowReply> {
        self.check_version(server, envelope.version)?;
        let endpoint = self.endpoint(server)?;
        let method = envelope.request.method();
        debug!(server = %server, method, version = %envelope.version, "RPC call");

        match tokio::time::timeout(self.call_timeout, endpoint.dispatch(envelope)).await {
            Ok(reply) => reply,
            Err(_) => Err(WorkflowError::RpcFailed(format!(
                "{} to {} timed out after {:?}",
                method, server, self.call_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::WorkflowRequest;
    use crate::types::RequestContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEndpoint {
        version: RpcVersion,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcEndpoint for CountingEndpoint {
        fn max_version(&self) -> RpcVersion {
            self.version
        }

        async fn dispatch(&self, _envelope: RpcEnvelope) -> Result<WorkflowReply> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkflowReply::Supported(true))
        }
    }

    fn endpoint(version: RpcVersion, delay: Duration) -> Arc<CountingEndpoint> {
        Arc::new(CountingEndpoint {
            version,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn envelope(version: RpcVersion) -> RpcEnvelope {
        RpcEnvelope::new(
            version,
            &RequestContext::admin(),
            WorkflowRequest::CheckSupportToForceDelete,
        )
    }

    #[tokio::test]
    async fn test_can_send_respects_cap_and_peer() {
        let transport = LocalTransport::new().with_version_cap(RpcVersion::V1_3);
        assert!(!transport.can_send_version("node1@simple", RpcVersion::V2_0));
        assert!(transport.can_send_version("node1@simple", RpcVersion::V1_1));

        let transport = LocalTransport::new();
        transport
            .register("old@simple", endpoint(RpcVersion::V1_3, Duration::ZERO))
            .unwrap();
        assert!(!transport.can_send_version("old@simple", RpcVersion::V2_0));
        assert!(transport.can_send_version("old@simple", RpcVersion::V1_1));
    }

    #[tokio::test]
    async fn test_cast_then_drain() {
        let transport = LocalTransport::new();
        let ep = endpoint(RpcVersion::V2_0, Duration::from_millis(10));
        transport.register("node1@simple", ep.clone()).unwrap();

        transport.cast("node1@simple", envelope(RpcVersion::V2_0)).await.unwrap();
        transport.drain().await;
        assert_eq!(ep.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let transport = LocalTransport::new().with_call_timeout(Duration::from_millis(20));
        transport
            .register("slow@simple", endpoint(RpcVersion::V2_0, Duration::from_secs(5)))
            .unwrap();

        let err = transport.call("slow@simple", envelope(RpcVersion::V2_0)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::RpcFailed(_)));
    }

    #[tokio::test]
    async fn test_send_above_peer_version_rejected() {
        let transport = LocalTransport::new();
        transport
            .register("old@simple", endpoint(RpcVersion::V1_3, Duration::ZERO))
            .unwrap();

        let err = transport.call("old@simple", envelope(RpcVersion::V2_0)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::VersionUnsupported { .. }));
        assert!(transport.call("missing@simple", envelope(RpcVersion::V2_0)).await.is_err());
    }
}
