//! Test utilities for mausb-host
//!
//! Provides a recording [`UrbBackend`] and helper functions for testing
//! across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{RecordingUrbBackend, create_mock_bulk_urb};
//! use common::UrbBackend;
//!
//! let backend = RecordingUrbBackend::new();
//! let mut urb = create_mock_bulk_urb(1, 0x81, 512);
//! backend.kill(&mut urb);
//! backend.free(urb);
//! assert_eq!(backend.kill_count(), 1);
//! assert_eq!(backend.free_count(), 1);
//! ```

use crate::usb_types::{SetupPacket, TransferKind, Urb, UrbBackend, UrbError, UrbId, UrbStatus};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

type KillHook = Box<dyn Fn(UrbId) + Send + Sync>;

#[derive(Default)]
struct Record {
    submitted: Vec<UrbId>,
    killed: Vec<UrbId>,
    freed: Vec<UrbId>,
    /// URBs that reached `free` still owning a buffer
    freed_with_buffers: Vec<UrbId>,
    /// Every id seen by `free`, to detect double frees
    seen_free: HashSet<UrbId>,
    double_frees: usize,
}

/// [`UrbBackend`] that records every call
///
/// Submissions complete immediately with the full buffer length unless a
/// failure was configured with [`RecordingUrbBackend::fail_submissions`], or
/// stay in flight after [`RecordingUrbBackend::defer_completions`].
#[derive(Default)]
pub struct RecordingUrbBackend {
    record: Mutex<Record>,
    deferred: AtomicBool,
    submit_error: Mutex<Option<UrbError>>,
    kill_hook: Mutex<Option<KillHook>>,
}

impl RecordingUrbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following submission fail with `error`
    pub fn fail_submissions(&self, error: UrbError) {
        *self.submit_error.lock().unwrap() = Some(error);
    }

    /// Leave submitted URBs in flight; the test reports completion itself
    pub fn defer_completions(&self) {
        self.deferred.store(true, Ordering::SeqCst);
    }

    /// Run `hook` inside every `kill` call
    ///
    /// Lets tests observe what is (and is not) locked while the blocking
    /// cancellation runs.
    pub fn set_kill_hook(&self, hook: impl Fn(UrbId) + Send + Sync + 'static) {
        *self.kill_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn submitted(&self) -> Vec<UrbId> {
        self.record.lock().unwrap().submitted.clone()
    }

    pub fn killed(&self) -> Vec<UrbId> {
        self.record.lock().unwrap().killed.clone()
    }

    pub fn freed(&self) -> Vec<UrbId> {
        self.record.lock().unwrap().freed.clone()
    }

    pub fn kill_count(&self) -> usize {
        self.record.lock().unwrap().killed.len()
    }

    pub fn free_count(&self) -> usize {
        self.record.lock().unwrap().freed.len()
    }

    pub fn double_frees(&self) -> usize {
        self.record.lock().unwrap().double_frees
    }

    /// URBs that were freed before their buffers were released
    pub fn freed_with_buffers(&self) -> Vec<UrbId> {
        self.record.lock().unwrap().freed_with_buffers.clone()
    }
}

impl UrbBackend for RecordingUrbBackend {
    fn submit(&self, urb: &mut Urb) -> Result<(), UrbError> {
        self.record.lock().unwrap().submitted.push(urb.id());

        if let Some(error) = self.submit_error.lock().unwrap().clone() {
            urb.set_status(UrbStatus::Failed(error.clone()));
            return Err(error);
        }

        if self.deferred.load(Ordering::SeqCst) {
            urb.set_status(UrbStatus::InFlight);
            return Ok(());
        }

        let actual_length = urb.transfer_buffer().map(|b| b.len()).unwrap_or(0);
        urb.set_status(UrbStatus::Completed { actual_length });
        Ok(())
    }

    fn kill(&self, urb: &mut Urb) {
        if let Some(hook) = self.kill_hook.lock().unwrap().as_ref() {
            hook(urb.id());
        }
        if *urb.status() == UrbStatus::InFlight {
            urb.set_status(UrbStatus::Killed);
        }
        self.record.lock().unwrap().killed.push(urb.id());
    }

    fn free(&self, urb: Urb) {
        let mut record = self.record.lock().unwrap();
        let id = urb.id();
        if !record.seen_free.insert(id) {
            record.double_frees += 1;
        }
        if urb.has_buffers() {
            record.freed_with_buffers.push(id);
        }
        record.freed.push(id);
    }
}

/// Create a bulk URB with a zeroed transfer buffer
pub fn create_mock_bulk_urb(id: u64, endpoint: u8, length: usize) -> Urb {
    Urb::new(UrbId(id), TransferKind::Bulk, endpoint).with_transfer_buffer(vec![0; length])
}

/// Create a control URB carrying both a setup packet and a data buffer
pub fn create_mock_control_urb(id: u64, setup: SetupPacket) -> Urb {
    let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
    Urb::new(UrbId(id), TransferKind::Control, 0)
        .with_setup_packet(setup)
        .with_transfer_buffer(vec![0; length])
}

/// Create a mock control transfer setup packet
///
/// # Arguments
/// * `request_type` - bmRequestType
/// * `request` - bRequest
/// * `value` - wValue
/// * `index` - wIndex
/// * `length` - wLength
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> SetupPacket {
    let [value_lo, value_hi] = value.to_le_bytes();
    let [index_lo, index_hi] = index.to_le_bytes();
    let [length_lo, length_hi] = length.to_le_bytes();
    [
        request_type,
        request,
        value_lo,
        value_hi,
        index_lo,
        index_hi,
        length_lo,
        length_hi,
    ]
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
