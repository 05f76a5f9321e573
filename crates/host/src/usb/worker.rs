//! USB worker thread
//!
//! Dedicated thread that owns the libusb context. It runs the
//! `handle_events` loop, applies hot-plug notifications and serves
//! [`HostCommand`]s from the Tokio runtime.

use crate::matcher::DeviceMatcher;
use crate::usb::manager::{BindPolicy, DeviceManager};
use common::{HostCommand, HostWorker};
use rusb::UsbContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timeout of one `handle_events` round
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: HostWorker,
}

impl UsbWorkerThread {
    pub fn new(
        worker: HostWorker,
        matcher: Arc<DeviceMatcher>,
        policy: BindPolicy,
    ) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(matcher, policy, worker.event_tx.clone())?;
        manager.initialize()?;

        Ok(Self { manager, worker })
    }

    /// Run until a Shutdown command arrives or the bridge closes
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(HostCommand::Shutdown) => {
                    info!("USB worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            match self.manager.context().handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            self.manager.process_hotplug_events();
        }

        info!("USB worker thread stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: HostCommand) {
        // A panic in one command must not take the USB thread down
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("Panic in USB command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::ListDevices { response } => {
                let devices = self.manager.list_devices();
                debug!("Listing {} devices", devices.len());
                let _ = response.send(devices);
            }
            HostCommand::Rescan => {
                debug!("Rescanning devices");
                self.manager.rescan();
            }
            HostCommand::Shutdown => {
                debug!("Shutdown is handled by the worker loop");
            }
        }
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(
    worker: HostWorker,
    matcher: Arc<DeviceMatcher>,
    policy: BindPolicy,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker, matcher, policy)?;
            worker_thread.run()
        })
}
