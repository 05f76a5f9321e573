//! Teardown drain of an exported device's pools
//!
//! Every pooled object is popped under the pool lock, then handled with the
//! lock released: its URB is killed (which may block on an in-flight
//! completion), its buffers are released, the URB is freed and the object
//! goes back to its cache. Wrappers drain before requests.

use crate::cache::ObjectCache;
use crate::device::{ExportedDevice, PooledRequest};
use crate::pool::{PoolState, RequestPool};
use common::{UrbBackend, UrbStatus};
use tracing::{debug, info, warn};

/// What one drain released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub wrappers_released: usize,
    pub requests_released: usize,
    /// URBs killed and freed
    pub urbs_killed: usize,
    /// Transfer buffers and setup packets released
    pub buffers_released: usize,
}

impl DrainReport {
    pub fn objects_released(&self) -> usize {
        self.wrappers_released + self.requests_released
    }
}

impl std::ops::AddAssign for DrainReport {
    fn add_assign(&mut self, other: Self) {
        self.wrappers_released += other.wrappers_released;
        self.requests_released += other.requests_released;
        self.urbs_killed += other.urbs_killed;
        self.buffers_released += other.buffers_released;
    }
}

/// Release every object held by `device`
///
/// `None` stands for a device that was never set up and does nothing. Safe
/// to call repeatedly; a drained device reports nothing on the next call.
pub fn drain_and_release(device: Option<&ExportedDevice>) -> DrainReport {
    let Some(device) = device else {
        return DrainReport::default();
    };

    let backend = device.backend().as_ref();
    let caches = device.caches();
    let mut report = DrainReport::default();

    report.wrappers_released = drain_pool(device.wrappers(), &caches.wrappers, backend, &mut report);
    report.requests_released = drain_pool(device.requests(), &caches.requests, backend, &mut report);

    if report.objects_released() > 0 {
        info!(
            "{}: drained {} wrappers and {} requests ({} URBs killed)",
            device.busid(),
            report.wrappers_released,
            report.requests_released,
            report.urbs_killed
        );
    }
    report
}

fn drain_pool<S: PoolState, T: PooledRequest>(
    pool: &RequestPool<S, T>,
    cache: &ObjectCache<T>,
    backend: &dyn UrbBackend,
    report: &mut DrainReport,
) -> usize {
    let mut released = 0;

    // The pool lock is held only inside pop
    while let Some((state, mut object)) = pool.pop() {
        let seqnum = object.seqnum();

        if let Some(mut urb) = object.urb_slot().take() {
            backend.kill(&mut urb);
            if *urb.status() == UrbStatus::InFlight {
                warn!(
                    "{} (seqnum {}) still in flight after kill, releasing anyway",
                    urb.id(),
                    seqnum
                );
            }
            report.buffers_released += urb.release_buffers();
            backend.free(urb);
            report.urbs_killed += 1;
        }

        debug!("released seqnum {} from {:?}", seqnum, state);
        cache.free(object);
        released += 1;
    }

    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busid::BusId;
    use crate::device::{PoolCaches, Pipeline};
    use crate::pool::{RequestState, WrapperState};
    use common::test_utils::{
        RecordingUrbBackend, create_mock_bulk_urb, create_mock_control_urb,
        create_mock_setup_packet,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<RecordingUrbBackend>, ExportedDevice) {
        let backend = Arc::new(RecordingUrbBackend::new());
        backend.defer_completions();
        let caches = Arc::new(PoolCaches::new(32, 32).unwrap());
        let device = ExportedDevice::new(BusId::new("2-1.4").unwrap(), caches, backend.clone());
        (backend, device)
    }

    #[test]
    fn test_drain_none_is_noop() {
        assert_eq!(drain_and_release(None), DrainReport::default());
    }

    #[test]
    fn test_drain_releases_every_object_once() {
        let (backend, device) = setup();
        for seqnum in 0..5 {
            device
                .submit_request(seqnum, Some(create_mock_bulk_urb(seqnum as u64, 0x81, 32)))
                .unwrap();
        }
        let setup_packet = create_mock_setup_packet(0x80, 0x06, 0x0100, 0, 18);
        device
            .submit_wrapper(10, Pipeline::Management, 0, Some(create_mock_control_urb(10, setup_packet)))
            .unwrap();

        let report = drain_and_release(Some(&device));

        assert_eq!(report.requests_released, 5);
        assert_eq!(report.wrappers_released, 1);
        assert_eq!(report.urbs_killed, 6);
        // Five bulk buffers, plus buffer and setup packet of the control URB
        assert_eq!(report.buffers_released, 7);

        assert_eq!(backend.kill_count(), 6);
        assert_eq!(backend.free_count(), 6);
        assert_eq!(backend.double_frees(), 0);
        assert!(backend.freed_with_buffers().is_empty());
        assert_eq!(device.outstanding(), 0);
        assert_eq!(device.caches().requests.live(), 0);
        assert_eq!(device.caches().wrappers.live(), 0);
    }

    #[test]
    fn test_drain_covers_every_state() {
        let (backend, device) = setup();
        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();
        device
            .submit_request(2, Some(create_mock_bulk_urb(2, 0x81, 8)))
            .unwrap();
        device.complete_request(2, UrbStatus::Completed { actual_length: 8 });
        device.submit_request(3, None).unwrap();
        let transmitted = device.next_completed_request().unwrap();
        device.recycle_request(transmitted);

        device
            .submit_wrapper(4, Pipeline::Outbound, 3, Some(create_mock_bulk_urb(4, 0x03, 8)))
            .unwrap();
        assert_eq!(device.requests().len_of(RequestState::Init), 1);
        assert_eq!(device.requests().len_of(RequestState::Tx), 1);
        assert_eq!(device.requests().len_of(RequestState::Free), 1);
        assert_eq!(device.wrappers().len_of(WrapperState::OutInit), 1);

        let report = drain_and_release(Some(&device));
        assert_eq!(report.objects_released(), 4);
        assert_eq!(backend.double_frees(), 0);
        assert_eq!(device.outstanding(), 0);
    }

    #[test]
    fn test_drain_is_idempotent() {
        let (backend, device) = setup();
        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();

        assert_eq!(drain_and_release(Some(&device)).objects_released(), 1);
        assert_eq!(drain_and_release(Some(&device)), DrainReport::default());
        assert_eq!(backend.free_count(), 1);
    }

    #[test]
    fn test_handle_less_objects_skip_backend() {
        let (backend, device) = setup();
        device.submit_request(1, None).unwrap();
        device.submit_wrapper(2, Pipeline::Inbound, 1, None).unwrap();

        let report = drain_and_release(Some(&device));
        assert_eq!(report.objects_released(), 2);
        assert_eq!(report.urbs_killed, 0);
        assert_eq!(backend.kill_count(), 0);
        assert_eq!(backend.free_count(), 0);
    }

    #[test]
    fn test_kill_runs_with_pool_unlocked() {
        let backend = Arc::new(RecordingUrbBackend::new());
        backend.defer_completions();
        let caches = Arc::new(PoolCaches::new(8, 8).unwrap());
        let device = Arc::new(ExportedDevice::new(
            BusId::new("1-2").unwrap(),
            caches,
            backend.clone(),
        ));

        let unlocked = Arc::new(AtomicUsize::new(0));
        {
            let device = Arc::downgrade(&device);
            let unlocked = unlocked.clone();
            backend.set_kill_hook(move |_| {
                if let Some(device) = device.upgrade()
                    && device.requests().try_len().is_some()
                    && device.wrappers().try_len().is_some()
                {
                    unlocked.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        for seqnum in 0..3 {
            device
                .submit_request(seqnum, Some(create_mock_bulk_urb(seqnum as u64, 0x81, 8)))
                .unwrap();
        }
        device
            .submit_wrapper(9, Pipeline::Inbound, 1, Some(create_mock_bulk_urb(9, 0x81, 8)))
            .unwrap();

        drain_and_release(Some(&device));
        assert_eq!(unlocked.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_killed_urbs_were_in_flight() {
        let (backend, device) = setup();
        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();

        drain_and_release(Some(&device));
        assert_eq!(backend.killed(), vec![common::UrbId(1)]);
    }
}
