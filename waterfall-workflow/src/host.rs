//! Host-string routing and the backend driver registry.
//!
//! Hosts are named `hostname@backend`. The backend part selects which
//! registered driver handles a job, and a job may only be touched by the
//! driver whose name matches the job's recorded `service`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::driver::{BackendDriver, DriverKind};
use crate::error::{Result, WorkflowError};
use crate::types::Job;

/// Return the backend part of `host`, if it has a non-empty one.
pub fn extract_backend(host: &str) -> Option<&str> {
    match host.split_once('@') {
        Some((_, backend)) if !backend.is_empty() => Some(backend),
        _ => None,
    }
}

/// Build a `hostname@backend` string.
pub fn compose_host(hostname: &str, backend: &str) -> String {
    format!("{}@{}", hostname, backend)
}

// =============================================================================
// Legacy service names
// =============================================================================

/// A retired service name and the driver name that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceMigration {
    /// Name recorded by older releases
    pub legacy: &'static str,
    /// Current driver name
    pub current: &'static str,
    /// RPC version from which the legacy name is no longer emitted
    pub retired_in: &'static str,
}

/// Table of legacy service names, consulted only while the legacy
/// compatibility window is open.
#[derive(Debug, Clone)]
pub struct ServiceMigrations {
    entries: &'static [ServiceMigration],
}

const MIGRATIONS_V1: &[ServiceMigration] = &[
    ServiceMigration {
        legacy: "waterfall.workflow.services.simple",
        current: crate::drivers::simple::DRIVER_NAME,
        retired_in: "1.3",
    },
    ServiceMigration {
        legacy: "waterfall.workflow.drivers.simple",
        current: crate::drivers::simple::DRIVER_NAME,
        retired_in: "2.0",
    },
];

impl ServiceMigrations {
    /// The built-in table.
    pub fn builtin() -> Self {
        Self { entries: MIGRATIONS_V1 }
    }

    /// Current name for `service`, or `service` itself when it is not legacy.
    pub fn resolve<'a>(&self, service: &'a str) -> &'a str {
        self.entries
            .iter()
            .find(|m| m.legacy == service)
            .map(|m| m.current)
            .unwrap_or(service)
    }

    /// All entries.
    pub fn entries(&self) -> &[ServiceMigration] {
        self.entries
    }
}

// =============================================================================
// Router
// =============================================================================

struct RegisteredBackend {
    kind: DriverKind,
    driver: Arc<dyn BackendDriver>,
}

/// Routes host strings to registered backend drivers.
pub struct HostRouter {
    /// Registered drivers by backend name
    backends: HashMap<String, RegisteredBackend>,
    /// Backend used when a host string names none
    default_backend: Option<String>,
    /// Legacy names, `None` once the compatibility window is closed
    migrations: Option<ServiceMigrations>,
}

impl HostRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_backend: None,
            migrations: None,
        }
    }

    /// Set the backend used for hosts without a backend part.
    pub fn with_default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    /// Accept legacy service names when matching services.
    pub fn with_legacy_compat(mut self, migrations: ServiceMigrations) -> Self {
        self.migrations = Some(migrations);
        self
    }

    /// Register a driver for a backend.
    ///
    /// Empty names and duplicate registrations are rejected here rather
    /// than discovered when a job arrives.
    pub fn register(
        &mut self,
        kind: DriverKind,
        backend: impl Into<String>,
        driver: Arc<dyn BackendDriver>,
    ) -> Result<()> {
        let backend = backend.into();
        if backend.is_empty() || backend.contains('@') {
            return Err(WorkflowError::InvalidConfig(format!(
                "invalid backend name '{}'",
                backend
            )));
        }
        if self.backends.contains_key(&backend) {
            return Err(WorkflowError::InvalidConfig(format!(
                "backend '{}' registered twice",
                backend
            )));
        }
        if driver.name() != kind.driver_name() {
            warn!(
                backend = %backend,
                kind = ?kind,
                driver = %driver.name(),
                "Driver name differs from its kind's default name"
            );
        }

        info!(backend = %backend, kind = ?kind, driver = %driver.name(), "Registered backend driver");
        self.backends.insert(backend, RegisteredBackend { kind, driver });
        Ok(())
    }

    /// Backend name for `host`.
    ///
    /// Without a backend part, fails with `NoBackendSpecified` unless
    /// `allow_null`, in which case the default or sole backend is used.
    pub fn backend_for(&self, host: Option<&str>, allow_null: bool) -> Result<String> {
        if let Some(backend) = host.and_then(extract_backend) {
            return Ok(backend.to_string());
        }

        if host.is_none() && !allow_null {
            return Err(WorkflowError::NoBackendSpecified);
        }

        if let Some(default) = &self.default_backend {
            return Ok(default.clone());
        }

        if self.backends.len() == 1 {
            if let Some(name) = self.backends.keys().next() {
                return Ok(name.clone());
            }
        }

        Err(WorkflowError::NoBackendSpecified)
    }

    /// Driver registered for `backend`.
    pub fn driver_for(&self, backend: &str) -> Result<Arc<dyn BackendDriver>> {
        self.backends
            .get(backend)
            .map(|b| b.driver.clone())
            .ok_or_else(|| WorkflowError::BackendNotRegistered(backend.to_string()))
    }

    /// Kind of the driver registered for `backend`.
    pub fn kind_for(&self, backend: &str) -> Result<DriverKind> {
        self.backends
            .get(backend)
            .map(|b| b.kind)
            .ok_or_else(|| WorkflowError::BackendNotRegistered(backend.to_string()))
    }

    /// Driver that should handle `job`, based on its host.
    pub fn driver_for_job(&self, job: &Job) -> Result<Arc<dyn BackendDriver>> {
        let backend = self.backend_for(job.host.as_deref(), true)?;
        self.driver_for(&backend)
    }

    /// Whether `service` names `driver`, honouring legacy names while the
    /// compatibility window is open.
    pub fn service_matches(&self, service: &str, driver: &dyn BackendDriver) -> bool {
        let resolved = match &self.migrations {
            Some(migrations) => migrations.resolve(service),
            None => service,
        };
        if resolved != service {
            debug!(legacy = %service, current = %resolved, "Resolved legacy service name");
        }
        resolved == driver.name()
    }

    /// Driver for `job` after checking the job was created by it.
    ///
    /// A job that never recorded a service passes.
    pub fn ensure_service(&self, job: &Job) -> Result<Arc<dyn BackendDriver>> {
        let driver = self.driver_for_job(job)?;
        if let Some(service) = job.service.as_deref() {
            if !self.service_matches(service, driver.as_ref()) {
                return Err(WorkflowError::ServiceMismatch {
                    job_id: job.id.clone(),
                    expected: service.to_string(),
                    actual: driver.name().to_string(),
                });
            }
        }
        Ok(driver)
    }

    /// Registered backend names.
    pub fn backends(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

impl Default for HostRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SimpleDriver;
    use crate::mock::MockDriver;

    fn router() -> HostRouter {
        let mut router = HostRouter::new();
        router
            .register(DriverKind::Simple, "simple", Arc::new(SimpleDriver::with_path("/tmp/wf")))
            .unwrap();
        router
    }

    #[test]
    fn test_extract_backend() {
        assert_eq!(extract_backend("node1@ceph"), Some("ceph"));
        assert_eq!(extract_backend("node1@ceph@extra"), Some("ceph@extra"));
        assert_eq!(extract_backend("node1@"), None);
        assert_eq!(extract_backend("node1"), None);
    }

    #[test]
    fn test_backend_for() {
        let router = router();
        assert_eq!(router.backend_for(Some("node1@fast"), false).unwrap(), "fast");
        assert!(matches!(
            router.backend_for(None, false),
            Err(WorkflowError::NoBackendSpecified)
        ));
        // Sole registered backend is the fallback
        assert_eq!(router.backend_for(None, true).unwrap(), "simple");
        assert_eq!(router.backend_for(Some("node1"), false).unwrap(), "simple");
    }

    #[test]
    fn test_backend_for_prefers_default() {
        let mut router = router().with_default_backend("mock");
        router
            .register(DriverKind::Mock, "mock", Arc::new(MockDriver::new()))
            .unwrap();
        assert_eq!(router.backend_for(None, true).unwrap(), "mock");
    }

    #[test]
    fn test_backend_for_ambiguous_without_default() {
        let mut router = router();
        router
            .register(DriverKind::Mock, "mock", Arc::new(MockDriver::new()))
            .unwrap();
        assert!(matches!(
            router.backend_for(None, true),
            Err(WorkflowError::NoBackendSpecified)
        ));
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let mut router = router();
        assert!(router
            .register(DriverKind::Mock, "simple", Arc::new(MockDriver::new()))
            .is_err());
        assert!(router
            .register(DriverKind::Mock, "", Arc::new(MockDriver::new()))
            .is_err());
        assert!(router
            .register(DriverKind::Mock, "a@b", Arc::new(MockDriver::new()))
            .is_err());
    }

    #[test]
    fn test_driver_for_unknown_backend() {
        let router = router();
        assert!(matches!(
            router.driver_for("ceph"),
            Err(WorkflowError::BackendNotRegistered(b)) if b == "ceph"
        ));
    }

    #[test]
    fn test_ensure_service() {
        let router = router();
        let mut job = Job::new("vol-1");
        job.host = Some("node1@simple".into());

        // No recorded service
        assert!(router.ensure_service(&job).is_ok());

        job.service = Some(crate::drivers::simple::DRIVER_NAME.into());
        assert!(router.ensure_service(&job).is_ok());

        job.service = Some("waterfall.workflow.drivers.swift.SwiftDriver".into());
        assert!(matches!(
            router.ensure_service(&job),
            Err(WorkflowError::ServiceMismatch { .. })
        ));
    }

    #[test]
    fn test_legacy_names_only_inside_window() {
        let mut job = Job::new("vol-1");
        job.host = Some("node1@simple".into());
        job.service = Some("waterfall.workflow.drivers.simple".into());

        assert!(router().ensure_service(&job).is_err());

        let router = router().with_legacy_compat(ServiceMigrations::builtin());
        assert!(router.ensure_service(&job).is_ok());
    }
}
