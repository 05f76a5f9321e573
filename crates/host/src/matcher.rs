//! Device-matching registration
//!
//! Binds attached devices whose bus id is registered and tears them down
//! again. The USB worker drives [`DeviceMatcher::probe`] and
//! [`DeviceMatcher::disconnect`] from enumeration and hot-plug; module
//! shutdown calls [`DeviceMatcher::deregister`], which disconnects every
//! bound device.
//!
//! Lock order: the bindings lock is taken before the registry lock and is
//! never held across a drain. Probe and disconnect update the registry under
//! the bindings lock, so a bound device always has an `Allocated` or
//! `PendingRemoval` entry.

use crate::busid::{BusId, BusIdStatus, BusIdTable};
use crate::device::{ExportedDevice, PoolCaches};
use crate::drain::{DrainReport, drain_and_release};
use crate::error::{Error, Result};
use common::UrbBackend;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Bindings {
    devices: HashMap<BusId, Arc<ExportedDevice>>,
    /// Unbound devices whose drain has not finished
    unbinding: HashSet<BusId>,
}

pub struct DeviceMatcher {
    registry: Arc<BusIdTable>,
    caches: Arc<PoolCaches>,
    bound: Mutex<Bindings>,
    registered: AtomicBool,
}

impl DeviceMatcher {
    pub fn new(registry: Arc<BusIdTable>, caches: Arc<PoolCaches>) -> Self {
        info!("Device matching registered");
        Self {
            registry,
            caches,
            bound: Mutex::new(Bindings::default()),
            registered: AtomicBool::new(true),
        }
    }

    pub fn registry(&self) -> &Arc<BusIdTable> {
        &self.registry
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    fn bound(&self) -> MutexGuard<'_, Bindings> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the device at `busid` if its registry entry is eligible
    ///
    /// Binding an already bound device succeeds without a second
    /// `ExportedDevice`. A device still draining from its last unbind is
    /// rejected until the drain completes.
    pub fn probe(&self, busid: &BusId, backend: Arc<dyn UrbBackend>) -> Result<Arc<ExportedDevice>> {
        if !self.is_registered() {
            return Err(Error::NotFound(format!(
                "{}: device matching is not registered",
                busid
            )));
        }

        let mut bound = self.bound();
        if let Some(device) = bound.devices.get(busid) {
            return Ok(device.clone());
        }
        if bound.unbinding.contains(busid) {
            return Err(Error::NotFound(format!("{}: unbind in progress", busid)));
        }

        self.registry.claim(busid)?;

        let device = Arc::new(ExportedDevice::new(
            busid.clone(),
            self.caches.clone(),
            backend,
        ));
        bound.devices.insert(busid.clone(), device.clone());
        info!("Bound device {}", busid);
        Ok(device)
    }

    /// Unbind the device at `busid`
    ///
    /// Drains its pools, then releases its registry entry. Returns `None` if
    /// the device was not bound.
    pub fn disconnect(&self, busid: &BusId) -> Option<DrainReport> {
        let device = {
            let mut bound = self.bound();
            let device = bound.devices.remove(busid)?;
            bound.unbinding.insert(busid.clone());
            device
        };

        let report = drain_and_release(Some(&device));
        if Arc::strong_count(&device) > 1 {
            // Another holder keeps the device alive; its pools are empty and
            // anything it queues later is released when it drops the device
            debug!("{}: device still referenced after unbind", busid);
        }
        drop(device);

        {
            let mut bound = self.bound();
            self.registry.release(busid);
            bound.unbinding.remove(busid);
        }
        info!(
            "Unbound device {} ({} objects released)",
            busid,
            report.objects_released()
        );
        Some(report)
    }

    /// Bound devices that must be unbound: entries pending removal or gone
    pub fn stale_devices(&self) -> Vec<BusId> {
        let bound: Vec<BusId> = self.bound().devices.keys().cloned().collect();
        bound
            .into_iter()
            .filter(|busid| {
                !matches!(
                    self.registry.status(busid),
                    Some(BusIdStatus::Allocated) | Some(BusIdStatus::Added)
                )
            })
            .collect()
    }

    /// Unbind every stale device
    pub fn release_stale(&self) -> Vec<(BusId, DrainReport)> {
        self.stale_devices()
            .into_iter()
            .filter_map(|busid| {
                let report = self.disconnect(&busid)?;
                Some((busid, report))
            })
            .collect()
    }

    pub fn get(&self, busid: &BusId) -> Option<Arc<ExportedDevice>> {
        self.bound().devices.get(busid).cloned()
    }

    pub fn is_bound(&self, busid: &BusId) -> bool {
        self.bound().devices.contains_key(busid)
    }

    /// Bus ids of bound devices, sorted
    pub fn bound_busids(&self) -> Vec<BusId> {
        let mut busids: Vec<BusId> = self.bound().devices.keys().cloned().collect();
        busids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        busids
    }

    /// Stop matching and unbind every bound device
    ///
    /// Later probes are rejected. Calling it twice is harmless.
    pub fn deregister(&self) -> DrainReport {
        if self.registered.swap(false, Ordering::AcqRel) {
            info!("Deregistering device matching");
        }

        let mut total = DrainReport::default();
        for busid in self.bound_busids() {
            if let Some(report) = self.disconnect(&busid) {
                total += report;
            }
        }

        let leftover = self.bound().devices.len();
        if leftover > 0 {
            warn!("{} devices bound during deregistration", leftover);
        }
        total
    }
}

impl std::fmt::Debug for DeviceMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMatcher")
            .field("registered", &self.is_registered())
            .field("bound", &self.bound_busids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Pipeline;
    use common::test_utils::{RecordingUrbBackend, create_mock_bulk_urb};

    fn setup() -> (Arc<BusIdTable>, DeviceMatcher, Arc<RecordingUrbBackend>) {
        let registry = Arc::new(BusIdTable::new());
        let caches = Arc::new(PoolCaches::new(16, 16).unwrap());
        let matcher = DeviceMatcher::new(registry.clone(), caches);
        let backend = Arc::new(RecordingUrbBackend::new());
        backend.defer_completions();
        (registry, matcher, backend)
    }

    fn id(s: &str) -> BusId {
        BusId::new(s).unwrap()
    }

    #[test]
    fn test_probe_requires_registered_busid() {
        let (registry, matcher, backend) = setup();

        assert!(matches!(
            matcher.probe(&id("1-1"), backend.clone()),
            Err(Error::NotFound(_))
        ));

        registry.add(&id("1-1")).unwrap();
        matcher.probe(&id("1-1"), backend.clone()).unwrap();
        assert_eq!(registry.status(&id("1-1")), Some(BusIdStatus::Allocated));
        assert!(matcher.is_bound(&id("1-1")));
    }

    #[test]
    fn test_probe_twice_keeps_one_device() {
        let (registry, matcher, backend) = setup();
        registry.add(&id("1-1")).unwrap();

        let first = matcher.probe(&id("1-1"), backend.clone()).unwrap();
        let second = matcher.probe(&id("1-1"), backend).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(matcher.bound_busids(), vec![id("1-1")]);
    }

    #[test]
    fn test_disconnect_drains_then_releases() {
        let (registry, matcher, backend) = setup();
        registry.add(&id("1-1")).unwrap();
        let device = matcher.probe(&id("1-1"), backend.clone()).unwrap();
        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();
        device
            .submit_wrapper(2, Pipeline::Inbound, 1, Some(create_mock_bulk_urb(2, 0x81, 8)))
            .unwrap();
        drop(device);

        let report = matcher.disconnect(&id("1-1")).unwrap();
        assert_eq!(report.objects_released(), 2);
        assert_eq!(backend.free_count(), 2);
        assert_eq!(registry.status(&id("1-1")), Some(BusIdStatus::Added));
        assert!(matcher.disconnect(&id("1-1")).is_none());
    }

    #[test]
    fn test_probe_during_unbind_drain_is_rejected() {
        let (registry, matcher, backend) = setup();
        let matcher = Arc::new(matcher);
        registry.add(&id("1-1")).unwrap();
        let device = matcher.probe(&id("1-1"), backend.clone()).unwrap();
        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();
        drop(device);

        // Re-probe from inside the drain, while the old device is half torn down
        let weak = Arc::downgrade(&matcher);
        let rebound = Arc::new(Mutex::new(None));
        let seen = rebound.clone();
        backend.set_kill_hook(move |_| {
            if let Some(matcher) = weak.upgrade() {
                let other = Arc::new(RecordingUrbBackend::new());
                *seen.lock().unwrap() = Some(matcher.probe(&id("1-1"), other).is_ok());
            }
        });

        matcher.disconnect(&id("1-1")).unwrap();

        assert_eq!(*rebound.lock().unwrap(), Some(false));
        assert!(!matcher.is_bound(&id("1-1")));
        assert_eq!(registry.status(&id("1-1")), Some(BusIdStatus::Added));

        // Once the drain is done the device binds again
        matcher.probe(&id("1-1"), Arc::new(RecordingUrbBackend::new())).unwrap();
        assert_eq!(registry.status(&id("1-1")), Some(BusIdStatus::Allocated));
    }

    #[test]
    fn test_concurrent_probe_and_disconnect_keep_registry_consistent() {
        let (registry, matcher, backend) = setup();
        let matcher = Arc::new(matcher);
        registry.add(&id("2-1")).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let matcher = matcher.clone();
                let backend = backend.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if n % 2 == 0 {
                            let _ = matcher.probe(&id("2-1"), backend.clone());
                        } else {
                            matcher.disconnect(&id("2-1"));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = if matcher.is_bound(&id("2-1")) {
            BusIdStatus::Allocated
        } else {
            BusIdStatus::Added
        };
        assert_eq!(registry.status(&id("2-1")), Some(expected));
    }

    #[test]
    fn test_pending_removal_is_released_and_erased() {
        let (registry, matcher, backend) = setup();
        registry.add(&id("3-2")).unwrap();
        matcher.probe(&id("3-2"), backend).unwrap();

        registry.remove(&id("3-2")).unwrap();
        assert_eq!(registry.status(&id("3-2")), Some(BusIdStatus::PendingRemoval));
        assert_eq!(matcher.stale_devices(), vec![id("3-2")]);

        let released = matcher.release_stale();
        assert_eq!(released.len(), 1);
        assert!(registry.lookup(&id("3-2")).is_none());
        assert!(matcher.stale_devices().is_empty());
    }

    #[test]
    fn test_deregister_unbinds_everything() {
        let (registry, matcher, backend) = setup();
        for busid in ["1-1", "1-2", "2-1"] {
            registry.add(&id(busid)).unwrap();
            let device = matcher.probe(&id(busid), backend.clone()).unwrap();
            device
                .submit_request(0, Some(create_mock_bulk_urb(0, 0x81, 8)))
                .unwrap();
        }

        let report = matcher.deregister();
        assert_eq!(report.requests_released, 3);
        assert!(matcher.bound_busids().is_empty());
        assert!(!matcher.is_registered());

        assert!(matcher.probe(&id("1-1"), backend).is_err());
        assert_eq!(matcher.deregister(), DrainReport::default());
    }
}
