//! Node wiring and lifecycle.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use waterfall_common::TimedOperation;
use waterfall_workflow::{
    compose_host, BackendDriver, ConnectorProperties, ConnectorSet, DriverKind, HostRouter,
    IscsiConnector, LocalConnector, LocalTransport, ManagerConfig, ManagerDeps, MemoryQuotaLedger,
    MemoryStore, MockConnector, MockDriver, MockVolumeService, NotificationStore, RequestContext,
    ServiceMigrations, SimpleDriver, WorkflowDispatcher, WorkflowManager, WorkflowRpcClient,
};

use crate::config::{Config, ConnectorProtocol};

/// Build the router with the configured backend's driver.
fn build_router(config: &Config) -> Result<HostRouter> {
    let backend = config.workflow.backend_name.clone();
    let driver: Arc<dyn BackendDriver> = match config.workflow.driver {
        DriverKind::Simple => {
            info!(path = %config.workflow.backup_path, "Using simple file driver");
            Arc::new(SimpleDriver::with_path(&config.workflow.backup_path))
        }
        DriverKind::Mock => {
            info!("Using mock driver");
            Arc::new(MockDriver::new())
        }
    };

    let mut router = HostRouter::new().with_default_backend(backend.clone());
    if config.workflow.legacy_service_compat {
        router = router.with_legacy_compat(ServiceMigrations::builtin());
    }
    router.register(config.workflow.driver, backend, driver)?;
    Ok(router)
}

/// Connectors for every protocol this node may be handed.
fn build_connectors(config: &Config, hostname: &str) -> ConnectorSet {
    let mut connectors = ConnectorSet::new(ConnectorProperties::for_host(hostname));
    // The in-process volume service hands out mock connections
    connectors.register(Arc::new(MockConnector::new()));

    match config.connector.protocol {
        ConnectorProtocol::Local => connectors.register(Arc::new(LocalConnector::new())),
        ConnectorProtocol::Iscsi => {
            info!(iscsiadm = %config.connector.iscsiadm_path, "Using iSCSI connector");
            connectors.register(Arc::new(
                IscsiConnector::new().with_iscsiadm(config.connector.iscsiadm_path.clone()),
            ))
        }
    }
    connectors
}

/// Periodically remove scratch resources left on failed jobs.
async fn maintenance_loop(
    manager: Arc<WorkflowManager>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = interval.as_secs(), "Starting maintenance loop");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match manager.cleanup_leaked_resources(&RequestContext::admin()).await {
                    Ok(0) => debug!("No leaked resources found"),
                    Ok(cleaned) => info!(cleaned, "Cleaned leaked resources"),
                    Err(e) => warn!(error = %e, "Leaked resource sweep failed"),
                }
            }
            _ = shutdown.recv() => {
                info!("Maintenance loop shutting down");
                break;
            }
        }
    }
}

/// Run the workflow node until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let hostname = config.node.get_hostname();
    let host = compose_host(&hostname, &config.workflow.backend_name);

    let router = Arc::new(build_router(&config)?);
    let connectors = Arc::new(build_connectors(&config, &hostname));

    let mut transport = LocalTransport::new()
        .with_call_timeout(Duration::from_secs(config.rpc.call_timeout_secs));
    if let Some(cap) = config.rpc.version_cap {
        info!(version_cap = %cap, "RPC version capped");
        transport = transport.with_version_cap(cap);
    }
    let transport = Arc::new(transport);

    let deps = ManagerDeps {
        store: Arc::new(MemoryStore::new()),
        volumes: Arc::new(MockVolumeService::with_scratch_device()?),
        connectors,
        quota: Arc::new(MemoryQuotaLedger::new()),
        notifier: Arc::new(NotificationStore::new()),
        rpc: Some(WorkflowRpcClient::new(transport.clone())),
    };

    let mut manager_config = ManagerConfig::new(host.clone());
    manager_config.availability_zone = config.node.availability_zone.clone();
    manager_config.offload_deletes = config.workflow.offload_deletes;
    manager_config.max_concurrent_operations = config.workflow.max_concurrent_operations;

    let manager = Arc::new(WorkflowManager::new(manager_config, router, deps)?);

    let dispatcher = if config.rpc.accept_legacy {
        WorkflowDispatcher::with_legacy(manager.clone())
    } else {
        WorkflowDispatcher::new(manager.clone())
    };
    transport.register(host.clone(), Arc::new(dispatcher))?;

    info!(
        host = %host,
        driver = %manager.driver_name(),
        availability_zone = ?config.node.availability_zone,
        "Workflow manager started"
    );

    let reconcile = TimedOperation::new("init_host");
    let summary = manager.init_host(&RequestContext::admin()).await?;
    reconcile.finish();
    info!(
        reset_creating = summary.reset_creating,
        reset_restoring = summary.reset_restoring,
        resumed_deletes = summary.resumed_deletes,
        cleaned_temp = summary.cleaned_temp,
        "Startup reconciliation complete"
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let maintenance = tokio::spawn(maintenance_loop(
        manager.clone(),
        Duration::from_secs(config.workflow.maintenance_interval_secs),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance loop ended abnormally");
    }

    let finished = manager.wait_for_offloaded_deletes().await;
    if finished > 0 {
        info!(finished, "Background deletes finished");
    }
    transport.drain().await;
    transport.unregister(&host);

    info!("Workflow node stopped");
    Ok(())
}
