//! libusb-backed [`UrbBackend`]

use crate::usb::device::OpenedDevice;
use crate::usb::transfers::{DEFAULT_TIMEOUT, execute_urb};
use common::{Urb, UrbBackend, UrbError, UrbId, UrbStatus};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// Executes URBs synchronously on an opened device
///
/// `submit` runs the transfer to completion on the calling thread. `kill`
/// waits for a concurrent execution of the same URB to finish; a URB that
/// is not executing is left alone unless it is still marked in flight.
pub struct RusbBackend {
    device: OpenedDevice,
    timeout: Duration,
    executing: Mutex<HashSet<UrbId>>,
    finished: Condvar,
}

impl RusbBackend {
    pub fn new(device: OpenedDevice) -> Self {
        Self::with_timeout(device, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(device: OpenedDevice, timeout: Duration) -> Self {
        Self {
            device,
            timeout,
            executing: Mutex::new(HashSet::new()),
            finished: Condvar::new(),
        }
    }

    fn executing(&self) -> MutexGuard<'_, HashSet<UrbId>> {
        self.executing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UrbBackend for RusbBackend {
    fn submit(&self, urb: &mut Urb) -> Result<(), UrbError> {
        let id = urb.id();
        if !self.executing().insert(id) {
            return Err(UrbError::Busy);
        }
        urb.set_status(UrbStatus::InFlight);

        let result = execute_urb(self.device.handle(), urb, self.timeout);

        self.executing().remove(&id);
        self.finished.notify_all();

        match result {
            Ok(actual_length) => {
                urb.set_status(UrbStatus::Completed { actual_length });
                Ok(())
            }
            Err(e) => {
                urb.set_status(UrbStatus::Failed(e.clone()));
                Err(e)
            }
        }
    }

    fn kill(&self, urb: &mut Urb) {
        let id = urb.id();
        let mut executing = self.executing();
        while executing.contains(&id) {
            trace!("{}: waiting for {} to finish", self.device.busid(), id);
            executing = self
                .finished
                .wait(executing)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(executing);

        if *urb.status() == UrbStatus::InFlight {
            urb.set_status(UrbStatus::Killed);
            debug!("{}: killed {}", self.device.busid(), id);
        }
    }

    fn free(&self, urb: Urb) {
        trace!("{}: freed {}", self.device.busid(), urb.id());
    }
}
