//! Host module lifecycle
//!
//! `init` builds the registry, the object caches and device matching in
//! that order. `shutdown` takes them down in reverse: control endpoints
//! first, then device matching (which drains every bound device), then the
//! caches.

use crate::busid::{BusId, BusIdTable};
use crate::config::PoolSettings;
use crate::control::{EndpointHandle, MatchBusIdAttribute};
use crate::device::PoolCaches;
use crate::drain::DrainReport;
use crate::error::Result;
use crate::matcher::DeviceMatcher;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What shutdown released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    pub endpoints_unregistered: usize,
    pub drain: DrainReport,
    /// Cache objects still live when the caches were destroyed
    pub leaked_objects: usize,
    /// Caches outlived shutdown because another owner still held them
    pub caches_retained: bool,
}

#[derive(Debug)]
pub struct HostModule {
    registry: Arc<BusIdTable>,
    caches: Arc<PoolCaches>,
    matcher: Arc<DeviceMatcher>,
    endpoints: Vec<EndpointHandle>,
}

impl HostModule {
    /// Bring the module up and register `exported` for export
    pub fn init(pool: &PoolSettings, exported: &[BusId]) -> Result<Self> {
        let registry = Arc::new(BusIdTable::new());

        let caches = PoolCaches::new(pool.request_cache_capacity, pool.wrapper_cache_capacity)
            .inspect_err(|e| error!("Failed to create object caches: {}", e))?;

        for busid in exported {
            if let Err(e) = registry.add(busid) {
                error!("Failed to register bus id {}: {}", busid, e);
                caches.destroy();
                return Err(e);
            }
        }

        let caches = Arc::new(caches);
        let matcher = Arc::new(DeviceMatcher::new(registry.clone(), caches.clone()));

        info!(
            "Host module initialized ({} bus ids registered)",
            registry.len()
        );
        Ok(Self {
            registry,
            caches,
            matcher,
            endpoints: Vec::new(),
        })
    }

    pub fn registry(&self) -> &Arc<BusIdTable> {
        &self.registry
    }

    pub fn caches(&self) -> &Arc<PoolCaches> {
        &self.caches
    }

    pub fn matcher(&self) -> &Arc<DeviceMatcher> {
        &self.matcher
    }

    pub fn attribute(&self) -> MatchBusIdAttribute {
        MatchBusIdAttribute::new(self.registry.clone())
    }

    /// Track a running control endpoint until shutdown
    pub fn register_endpoint(&mut self, endpoint: EndpointHandle) {
        self.endpoints.push(endpoint);
    }

    pub fn endpoints(&self) -> &[EndpointHandle] {
        &self.endpoints
    }

    /// Stop every control endpoint, returning how many were running
    pub fn unregister_endpoints(&mut self) -> usize {
        let count = self.endpoints.len();
        for endpoint in self.endpoints.drain(..) {
            endpoint.unregister();
        }
        count
    }

    pub fn shutdown(mut self) -> ShutdownReport {
        info!("Shutting down host module");
        let mut report = ShutdownReport {
            endpoints_unregistered: self.unregister_endpoints(),
            ..ShutdownReport::default()
        };

        report.drain = self.matcher.deregister();

        let Self {
            caches, matcher, ..
        } = self;
        drop(matcher);

        match Arc::try_unwrap(caches) {
            Ok(caches) => report.leaked_objects = caches.destroy(),
            Err(caches) => {
                warn!(
                    "Object caches still referenced ({} owners), leaving them to the last owner",
                    Arc::strong_count(&caches) - 1
                );
                report.caches_retained = true;
            }
        }

        info!(
            "Host module stopped: {} endpoints, {} objects drained",
            report.endpoints_unregistered,
            report.drain.objects_released()
        );
        report
    }
}
