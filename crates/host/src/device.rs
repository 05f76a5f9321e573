//! Exported device and its request lifecycle
//!
//! An [`ExportedDevice`] exists for every device bound for export. It owns a
//! transfer-request pool and a transport-wrapper pool; both are drained by
//! [`crate::drain::drain_and_release`] before the device goes away, and
//! dropping the device runs that drain.
//!
//! Lifecycle of a transfer request:
//!
//! ```text
//!  submit ──► Init ──complete──► Tx ──transmitted──► Free ──reuse──► submit
//!                                  └──────────────retire──────────► cache
//! ```
//!
//! Transport wrappers follow the same shape with one `*Init` queue per
//! pipeline (inbound, outbound, management).

use crate::busid::BusId;
use crate::cache::{CacheObject, ObjectCache};
use crate::drain::drain_and_release;
use crate::error::Result;
use crate::pool::{PoolState, RequestPool, RequestState, WrapperState};
use common::{Urb, UrbBackend, UrbStatus};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Object owned by a pool that may hold a URB
pub trait PooledRequest: Send + 'static {
    /// Sequence number assigned by the remote
    fn seqnum(&self) -> u32;

    /// The URB slot of this object
    fn urb_slot(&mut self) -> &mut Option<Urb>;
}

/// A USB transfer relayed for the remote
///
/// Dropping a request that still holds its URB kills and frees the URB
/// through the backend, as the drain would.
pub struct TransferRequest {
    pub seqnum: u32,
    pub urb: Option<Urb>,
    backend: Arc<dyn UrbBackend>,
}

impl PooledRequest for TransferRequest {
    fn seqnum(&self) -> u32 {
        self.seqnum
    }

    fn urb_slot(&mut self) -> &mut Option<Urb> {
        &mut self.urb
    }
}

impl Drop for TransferRequest {
    fn drop(&mut self) {
        release_orphan(self.backend.as_ref(), self.seqnum, &mut self.urb);
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("seqnum", &self.seqnum)
            .field("urb", &self.urb)
            .finish_non_exhaustive()
    }
}

/// Transport pipeline a wrapper belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipeline {
    Inbound,
    Outbound,
    Management,
}

impl Pipeline {
    /// Queue holding submitted wrappers of this pipeline
    pub fn init_state(self) -> WrapperState {
        match self {
            Pipeline::Inbound => WrapperState::InInit,
            Pipeline::Outbound => WrapperState::OutInit,
            Pipeline::Management => WrapperState::MgmtInit,
        }
    }
}

/// A request together with the network-transport metadata used to relay it
pub struct TransportWrapper {
    pub seqnum: u32,
    pub pipeline: Pipeline,
    /// Endpoint handle the remote addressed
    pub endpoint_handle: u16,
    pub urb: Option<Urb>,
    backend: Arc<dyn UrbBackend>,
}

impl PooledRequest for TransportWrapper {
    fn seqnum(&self) -> u32 {
        self.seqnum
    }

    fn urb_slot(&mut self) -> &mut Option<Urb> {
        &mut self.urb
    }
}

impl Drop for TransportWrapper {
    fn drop(&mut self) {
        release_orphan(self.backend.as_ref(), self.seqnum, &mut self.urb);
    }
}

impl fmt::Debug for TransportWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportWrapper")
            .field("seqnum", &self.seqnum)
            .field("pipeline", &self.pipeline)
            .field("endpoint_handle", &self.endpoint_handle)
            .field("urb", &self.urb)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct PoolCaches {
    pub requests: ObjectCache<TransferRequest>,
    pub wrappers: ObjectCache<TransportWrapper>,
}

impl PoolCaches {
    /// Create both caches; if the second fails the first is destroyed
    pub fn new(request_capacity: usize, wrapper_capacity: usize) -> Result<Self> {
        let requests = ObjectCache::new("transfer_request", request_capacity)?;
        let wrappers = match ObjectCache::new("transport_wrapper", wrapper_capacity) {
            Ok(cache) => cache,
            Err(e) => {
                requests.destroy();
                return Err(e);
            }
        };
        Ok(Self { requests, wrappers })
    }

    /// Destroy both caches, returning the number of objects still live
    pub fn destroy(self) -> usize {
        let requests = self.requests.destroy();
        let wrappers = self.wrappers.destroy();
        requests.live + wrappers.live
    }
}

/// Objects each pool queue holds before its first reallocation
pub const QUEUE_RESERVE: usize = 16;

/// One device bound for export
pub struct ExportedDevice {
    busid: BusId,
    caches: Arc<PoolCaches>,
    backend: Arc<dyn UrbBackend>,
    requests: RequestPool<RequestState, TransferRequest>,
    wrappers: RequestPool<WrapperState, TransportWrapper>,
}

impl ExportedDevice {
    pub fn new(busid: BusId, caches: Arc<PoolCaches>, backend: Arc<dyn UrbBackend>) -> Self {
        let requests = RequestPool::new(caches.requests.capacity().min(QUEUE_RESERVE));
        let wrappers = RequestPool::new(caches.wrappers.capacity().min(QUEUE_RESERVE));
        debug!("Created exported device {}", busid);

        Self {
            busid,
            caches,
            backend,
            requests,
            wrappers,
        }
    }

    pub fn busid(&self) -> &BusId {
        &self.busid
    }

    pub fn backend(&self) -> &Arc<dyn UrbBackend> {
        &self.backend
    }

    pub fn caches(&self) -> &Arc<PoolCaches> {
        &self.caches
    }

    pub fn requests(&self) -> &RequestPool<RequestState, TransferRequest> {
        &self.requests
    }

    pub fn wrappers(&self) -> &RequestPool<WrapperState, TransportWrapper> {
        &self.wrappers
    }

    /// Objects held across both pools
    pub fn outstanding(&self) -> usize {
        self.requests.len() + self.wrappers.len()
    }

    /// Submit a transfer request for `seqnum`
    ///
    /// Returns the state the request landed in: `Init` while the hardware
    /// still owns it, `Tx` if it completed or failed during submission. A
    /// failed submission is not an error here; its status travels to the
    /// remote like any completion. Only cache exhaustion is, and then the URB
    /// is released immediately.
    pub fn submit_request(&self, seqnum: u32, urb: Option<Urb>) -> Result<RequestState> {
        let request = TransferRequest {
            seqnum,
            urb: None,
            backend: self.backend.clone(),
        };
        let mut object = match self.caches.requests.alloc(request) {
            Ok(object) => object,
            Err(e) => {
                if let Some(urb) = urb {
                    release_urb(self.backend.as_ref(), urb);
                }
                warn!("{}: dropping request {}: {}", self.busid, seqnum, e);
                return Err(e);
            }
        };
        object.urb = urb;

        let state = submit_object(
            self.backend.as_ref(),
            &mut *object,
            RequestState::Init,
            RequestState::Tx,
        );
        trace!("{}: request {} queued in {:?}", self.busid, seqnum, state);
        self.requests.push(state, object);
        Ok(state)
    }

    /// Record the hardware completion of request `seqnum` (Init → Tx)
    ///
    /// Returns false if no submitted request carries `seqnum`.
    pub fn complete_request(&self, seqnum: u32, status: UrbStatus) -> bool {
        complete_object(&self.requests, RequestState::Init, RequestState::Tx, seqnum, status)
    }

    /// Next completed request awaiting transmission
    #[must_use]
    pub fn next_completed_request(&self) -> Option<CacheObject<TransferRequest>> {
        self.requests.pop_state(RequestState::Tx)
    }

    /// Park a transmitted request for reuse (→ Free)
    pub fn recycle_request(&self, mut request: CacheObject<TransferRequest>) {
        reset_urb(request.urb_slot());
        self.requests.push(RequestState::Free, request);
    }

    /// Take a parked request for a new submission
    #[must_use]
    pub fn reuse_request(&self) -> Option<CacheObject<TransferRequest>> {
        self.requests.pop_state(RequestState::Free)
    }

    /// Release a request permanently: its URB, then its cache slot
    pub fn retire_request(&self, mut request: CacheObject<TransferRequest>) {
        if let Some(urb) = request.urb_slot().take() {
            release_urb(self.backend.as_ref(), urb);
        }
        self.caches.requests.free(request);
    }

    /// Submit a transport wrapper on `pipeline`
    pub fn submit_wrapper(
        &self,
        seqnum: u32,
        pipeline: Pipeline,
        endpoint_handle: u16,
        urb: Option<Urb>,
    ) -> Result<WrapperState> {
        let wrapper = TransportWrapper {
            seqnum,
            pipeline,
            endpoint_handle,
            urb: None,
            backend: self.backend.clone(),
        };
        let mut object = match self.caches.wrappers.alloc(wrapper) {
            Ok(object) => object,
            Err(e) => {
                if let Some(urb) = urb {
                    release_urb(self.backend.as_ref(), urb);
                }
                warn!("{}: dropping wrapper {}: {}", self.busid, seqnum, e);
                return Err(e);
            }
        };
        object.urb = urb;

        let state = submit_object(
            self.backend.as_ref(),
            &mut *object,
            pipeline.init_state(),
            WrapperState::Tx,
        );
        trace!("{}: wrapper {} queued in {:?}", self.busid, seqnum, state);
        self.wrappers.push(state, object);
        Ok(state)
    }

    /// Record the completion of wrapper `seqnum` on `pipeline` (→ Tx)
    pub fn complete_wrapper(&self, pipeline: Pipeline, seqnum: u32, status: UrbStatus) -> bool {
        complete_object(
            &self.wrappers,
            pipeline.init_state(),
            WrapperState::Tx,
            seqnum,
            status,
        )
    }

    /// Next completed wrapper awaiting transmission
    #[must_use]
    pub fn next_completed_wrapper(&self) -> Option<CacheObject<TransportWrapper>> {
        self.wrappers.pop_state(WrapperState::Tx)
    }

    /// Park a transmitted wrapper for reuse (→ Free)
    pub fn recycle_wrapper(&self, mut wrapper: CacheObject<TransportWrapper>) {
        reset_urb(wrapper.urb_slot());
        self.wrappers.push(WrapperState::Free, wrapper);
    }

    /// Take a parked wrapper for a new submission
    #[must_use]
    pub fn reuse_wrapper(&self) -> Option<CacheObject<TransportWrapper>> {
        self.wrappers.pop_state(WrapperState::Free)
    }

    /// Release a wrapper permanently
    pub fn retire_wrapper(&self, mut wrapper: CacheObject<TransportWrapper>) {
        if let Some(urb) = wrapper.urb_slot().take() {
            release_urb(self.backend.as_ref(), urb);
        }
        self.caches.wrappers.free(wrapper);
    }
}

impl Drop for ExportedDevice {
    fn drop(&mut self) {
        let report = drain_and_release(Some(self));
        if report.objects_released() > 0 {
            debug!(
                "{}: released {} pooled objects on drop",
                self.busid,
                report.objects_released()
            );
        }
    }
}

impl fmt::Debug for ExportedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedDevice")
            .field("busid", &self.busid)
            .field("requests", &self.requests)
            .field("wrappers", &self.wrappers)
            .finish()
    }
}

/// Hand the object's URB to the backend and pick the queue it belongs in
fn submit_object<S: PoolState, T: PooledRequest>(
    backend: &dyn UrbBackend,
    object: &mut T,
    pending: S,
    completed: S,
) -> S {
    let seqnum = object.seqnum();
    let Some(urb) = object.urb_slot().as_mut() else {
        // Nothing for the hardware to do; the result is ready to transmit
        return completed;
    };

    urb.set_status(UrbStatus::InFlight);
    if let Err(e) = backend.submit(urb) {
        debug!("submission of {} (seqnum {}) failed: {}", urb.id(), seqnum, e);
        urb.set_status(UrbStatus::Failed(e));
    }

    if *urb.status() == UrbStatus::InFlight {
        pending
    } else {
        completed
    }
}

fn complete_object<S: PoolState, T: PooledRequest>(
    pool: &RequestPool<S, T>,
    from: S,
    to: S,
    seqnum: u32,
    status: UrbStatus,
) -> bool {
    let moved = pool.transition(
        from,
        to,
        |object| object.seqnum() == seqnum,
        |object| {
            if let Some(urb) = object.urb_slot().as_mut() {
                urb.set_status(status);
            }
        },
    );
    if !moved {
        debug!("completion for unknown seqnum {} in {:?}", seqnum, from);
    }
    moved
}

fn reset_urb(slot: &mut Option<Urb>) {
    if let Some(urb) = slot.as_mut() {
        urb.set_status(UrbStatus::Idle);
    }
}

/// Kill and free a URB left in an object dropped outside its pool
fn release_orphan(backend: &dyn UrbBackend, seqnum: u32, slot: &mut Option<Urb>) {
    let Some(mut urb) = slot.take() else {
        return;
    };
    warn!(
        "{} (seqnum {}) dropped without being retired, releasing",
        urb.id(),
        seqnum
    );
    if *urb.status() == UrbStatus::InFlight {
        backend.kill(&mut urb);
    }
    release_urb(backend, urb);
}

/// Release a URB that is known not to be in flight
fn release_urb(backend: &dyn UrbBackend, mut urb: Urb) {
    urb.release_buffers();
    backend.free(urb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{RecordingUrbBackend, create_mock_bulk_urb};
    use common::{UrbError, UrbId};

    fn setup(capacity: usize) -> (Arc<RecordingUrbBackend>, ExportedDevice) {
        let backend = Arc::new(RecordingUrbBackend::new());
        let caches = Arc::new(PoolCaches::new(capacity, capacity).unwrap());
        let device = ExportedDevice::new(BusId::new("1-1").unwrap(), caches, backend.clone());
        (backend, device)
    }

    #[test]
    fn test_pool_caches_failure_cleans_up() {
        assert!(PoolCaches::new(4, 0).is_err());
        assert!(PoolCaches::new(0, 4).is_err());
    }

    #[test]
    fn test_synchronous_completion_goes_to_tx() {
        let (backend, device) = setup(8);

        let state = device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 64)))
            .unwrap();
        assert_eq!(state, RequestState::Tx);
        assert_eq!(backend.submitted(), vec![UrbId(1)]);

        let request = device.next_completed_request().unwrap();
        assert_eq!(request.seqnum, 1);
        assert_eq!(
            request.urb.as_ref().unwrap().status(),
            &UrbStatus::Completed { actual_length: 64 }
        );
    }

    #[test]
    fn test_deferred_completion_lifecycle() {
        let (backend, device) = setup(8);
        backend.defer_completions();

        let state = device
            .submit_request(7, Some(create_mock_bulk_urb(7, 0x02, 16)))
            .unwrap();
        assert_eq!(state, RequestState::Init);
        assert!(device.next_completed_request().is_none());

        assert!(device.complete_request(7, UrbStatus::Completed { actual_length: 16 }));
        assert!(!device.complete_request(7, UrbStatus::Completed { actual_length: 16 }));

        let request = device.next_completed_request().unwrap();
        device.recycle_request(request);
        assert_eq!(device.requests().len_of(RequestState::Free), 1);

        let reused = device.reuse_request().unwrap();
        assert_eq!(reused.urb.as_ref().unwrap().status(), &UrbStatus::Idle);
        device.retire_request(reused);

        assert!(device.requests().is_empty());
        assert_eq!(backend.freed(), vec![UrbId(7)]);
        assert_eq!(device.caches().requests.live(), 0);
    }

    #[test]
    fn test_failed_submission_is_transmitted() {
        let (backend, device) = setup(8);
        backend.fail_submissions(UrbError::NoDevice);

        let state = device
            .submit_request(3, Some(create_mock_bulk_urb(3, 0x81, 8)))
            .unwrap();
        assert_eq!(state, RequestState::Tx);

        let request = device.next_completed_request().unwrap();
        assert_eq!(
            request.urb.as_ref().unwrap().status(),
            &UrbStatus::Failed(UrbError::NoDevice)
        );
        device.retire_request(request);
    }

    #[test]
    fn test_cache_exhaustion_releases_urb() {
        let (backend, device) = setup(1);
        device.submit_request(1, None).unwrap();

        let err = device
            .submit_request(2, Some(create_mock_bulk_urb(2, 0x81, 8)))
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::AllocationFailure(_)));
        assert_eq!(backend.freed(), vec![UrbId(2)]);
        assert!(backend.freed_with_buffers().is_empty());
        assert_eq!(device.outstanding(), 1);
    }

    #[test]
    fn test_wrappers_route_by_pipeline() {
        let (backend, device) = setup(8);
        backend.defer_completions();

        device
            .submit_wrapper(1, Pipeline::Outbound, 2, Some(create_mock_bulk_urb(11, 0x02, 8)))
            .unwrap();
        device
            .submit_wrapper(2, Pipeline::Inbound, 1, Some(create_mock_bulk_urb(12, 0x81, 8)))
            .unwrap();
        device
            .submit_wrapper(3, Pipeline::Management, 0, None)
            .unwrap();

        assert_eq!(device.wrappers().len_of(WrapperState::OutInit), 1);
        assert_eq!(device.wrappers().len_of(WrapperState::InInit), 1);
        // Handle-less management wrappers are ready immediately
        assert_eq!(device.wrappers().len_of(WrapperState::Tx), 1);

        assert!(device.complete_wrapper(
            Pipeline::Inbound,
            2,
            UrbStatus::Completed { actual_length: 8 }
        ));
        assert!(!device.complete_wrapper(Pipeline::Outbound, 2, UrbStatus::Killed));
        assert_eq!(device.wrappers().len_of(WrapperState::Tx), 2);

        let first = device.next_completed_wrapper().unwrap();
        assert_eq!(first.seqnum, 3);
        device.recycle_wrapper(first);
        let reused = device.reuse_wrapper().unwrap();
        device.retire_wrapper(reused);
    }

    #[test]
    fn test_dropped_request_releases_urb_and_slot() {
        let (backend, device) = setup(1);

        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();
        let request = device.next_completed_request().unwrap();
        drop(request);

        assert_eq!(device.caches().requests.live(), 0);
        assert_eq!(device.caches().requests.stats().reclaimed, 1);
        assert_eq!(backend.freed(), vec![UrbId(1)]);
        assert!(backend.freed_with_buffers().is_empty());

        device
            .submit_request(2, Some(create_mock_bulk_urb(2, 0x81, 8)))
            .unwrap();
        assert_eq!(device.outstanding(), 1);
    }

    #[test]
    fn test_dropped_in_flight_wrapper_is_killed() {
        let (backend, device) = setup(2);
        backend.defer_completions();

        device
            .submit_wrapper(4, Pipeline::Outbound, 3, Some(create_mock_bulk_urb(4, 0x02, 8)))
            .unwrap();
        let wrapper = device
            .wrappers()
            .unlink(WrapperState::OutInit, |w| w.seqnum == 4)
            .unwrap();
        drop(wrapper);

        assert_eq!(backend.killed(), vec![UrbId(4)]);
        assert_eq!(backend.freed(), vec![UrbId(4)]);
        assert_eq!(device.caches().wrappers.live(), 0);
        assert_eq!(backend.double_frees(), 0);
    }

    #[test]
    fn test_queues_grow_past_reserve() {
        let capacity = QUEUE_RESERVE * 3;
        let (backend, device) = setup(capacity);
        backend.defer_completions();

        for seqnum in 0..capacity as u32 {
            let urb = create_mock_bulk_urb(u64::from(seqnum), 0x81, 8);
            assert_eq!(device.submit_request(seqnum, Some(urb)).unwrap(), RequestState::Init);
        }
        assert_eq!(device.requests().len_of(RequestState::Init), capacity);

        let report = drain_and_release(Some(&device));
        assert_eq!(report.requests_released, capacity);
        assert_eq!(backend.free_count(), capacity);
    }

    #[test]
    fn test_drop_drains_device() {
        let (backend, device) = setup(8);
        backend.defer_completions();
        let caches = device.caches().clone();
        device
            .submit_request(1, Some(create_mock_bulk_urb(1, 0x81, 8)))
            .unwrap();
        device
            .submit_wrapper(2, Pipeline::Inbound, 1, Some(create_mock_bulk_urb(2, 0x81, 8)))
            .unwrap();

        drop(device);

        assert_eq!(caches.requests.live(), 0);
        assert_eq!(caches.wrappers.live(), 0);
        assert_eq!(backend.kill_count(), 2);
        assert_eq!(backend.free_count(), 2);
    }
}
