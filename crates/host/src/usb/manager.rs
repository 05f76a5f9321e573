//! USB device manager
//!
//! Tracks attached devices by bus id and drives device matching from
//! enumeration, hot-plug and rescans. Runs on the USB worker thread.

use crate::busid::{BusId, BusIdStatus};
use crate::matcher::DeviceMatcher;
use crate::usb::backend::RusbBackend;
use crate::usb::device::{UsbDevice, busid_of};
use common::{HostEvent, UsbDeviceSummary};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Whether the manager binds eligible devices or only tracks them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPolicy {
    /// Open and bind every attached device with an eligible entry
    Bind,
    /// Enumerate and report devices without opening any of them
    ListOnly,
}

/// Hot-plug notification queued for the worker loop
enum HotplugEvent {
    Arrived(Device<Context>),
    Left { bus: u8, address: u8 },
}

pub struct DeviceManager {
    context: Context,
    matcher: Arc<DeviceMatcher>,
    policy: BindPolicy,
    /// Attached devices by bus id
    devices: HashMap<BusId, UsbDevice>,
    _hotplug_registration: Option<Registration<Context>>,
    hotplug_tx: async_channel::Sender<HotplugEvent>,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
    event_sender: async_channel::Sender<HostEvent>,
}

impl DeviceManager {
    pub fn new(
        matcher: Arc<DeviceMatcher>,
        policy: BindPolicy,
        event_sender: async_channel::Sender<HostEvent>,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (hotplug_tx, hotplug_rx) = async_channel::unbounded();

        Ok(Self {
            context,
            matcher,
            policy,
            devices: HashMap::new(),
            _hotplug_registration: None,
            hotplug_tx,
            hotplug_rx,
            event_sender,
        })
    }

    /// Enumerate attached devices, register hot-plug and bind eligible ones
    pub fn initialize(&mut self) -> Result<(), rusb::Error> {
        self.enumerate_devices()?;
        self.register_hotplug()?;
        self.rescan();

        info!(
            "Device manager initialized with {} devices",
            self.devices.len()
        );
        Ok(())
    }

    fn enumerate_devices(&mut self) -> Result<(), rusb::Error> {
        let devices = self.context.devices()?;

        for device in devices.iter() {
            self.add_device(device);
        }

        debug!("Enumerated {} devices", self.devices.len());
        Ok(())
    }

    fn register_hotplug(&mut self) -> Result<(), rusb::Error> {
        if !rusb::has_hotplug() {
            warn!("libusb has no hot-plug support, devices are matched on rescan only");
            return Ok(());
        }

        let callback = HotplugCallback {
            queue: self.hotplug_tx.clone(),
        };

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(callback))?;

        self._hotplug_registration = Some(registration);
        debug!("Hot-plug callbacks registered");
        Ok(())
    }

    /// Track `device`, returning its bus id
    ///
    /// Root hubs have no bus id and are skipped.
    fn add_device(&mut self, device: Device<Context>) -> Option<BusId> {
        let Some(busid) = busid_of(&device) else {
            debug!(
                "Skipping device without bus id: bus={}, addr={}",
                device.bus_number(),
                device.address()
            );
            return None;
        };

        if self.devices.contains_key(&busid) {
            return Some(busid);
        }

        match UsbDevice::new(device) {
            Ok(usb_device) => {
                let summary = usb_device.summary(false);
                debug!(
                    "Added device {}: vid={:#06x}, pid={:#06x}",
                    busid, summary.vendor_id, summary.product_id
                );
                self.devices.insert(busid.clone(), usb_device);
                Some(busid)
            }
            Err(e) => {
                warn!("Failed to add device {}: {}", busid, e);
                None
            }
        }
    }

    /// Bind `busid` if it is attached, registered and not bound yet
    fn try_bind(&self, busid: &BusId) {
        if self.policy == BindPolicy::ListOnly {
            return;
        }
        if self.matcher.is_bound(busid) || !self.matcher.is_registered() {
            return;
        }
        if !matches!(
            self.matcher.registry().status(busid),
            Some(BusIdStatus::Added) | Some(BusIdStatus::Allocated)
        ) {
            return;
        }
        let Some(device) = self.devices.get(busid) else {
            return;
        };

        let result = device
            .open()
            .and_then(|opened| self.matcher.probe(busid, Arc::new(RusbBackend::new(opened))));

        match result {
            Ok(_) => self.send_event(HostEvent::DeviceExported {
                busid: busid.to_string(),
            }),
            Err(e) => {
                warn!("Failed to bind device {}: {}", busid, e);
                self.send_event(HostEvent::ProbeRejected {
                    busid: busid.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn unbind(&self, busid: &BusId) {
        if let Some(report) = self.matcher.disconnect(busid) {
            self.send_event(HostEvent::DeviceReleased {
                busid: busid.to_string(),
                objects_released: report.objects_released(),
            });
        }
    }

    /// Re-run matching against the registry
    ///
    /// Releases bound devices whose entry is pending removal or gone, then
    /// binds every attached device that became eligible.
    pub fn rescan(&mut self) {
        for (busid, report) in self.matcher.release_stale() {
            self.send_event(HostEvent::DeviceReleased {
                busid: busid.to_string(),
                objects_released: report.objects_released(),
            });
        }

        let attached: Vec<BusId> = self.devices.keys().cloned().collect();
        for busid in attached {
            self.try_bind(&busid);
        }
    }

    pub fn handle_device_arrived(&mut self, device: Device<Context>) {
        if let Some(busid) = self.add_device(device) {
            info!("Device {} arrived", busid);
            self.try_bind(&busid);
        }
    }

    pub fn handle_device_left(&mut self, bus: u8, address: u8) {
        let busid = self
            .devices
            .iter()
            .find(|(_, device)| device.bus_number() == bus && device.device_address() == address)
            .map(|(busid, _)| busid.clone());

        if let Some(busid) = busid {
            info!("Device {} left", busid);
            self.unbind(&busid);
            self.devices.remove(&busid);
        }
    }

    /// Apply hot-plug notifications queued by the callback
    pub fn process_hotplug_events(&mut self) {
        while let Ok(event) = self.hotplug_rx.try_recv() {
            match event {
                HotplugEvent::Arrived(device) => self.handle_device_arrived(device),
                HotplugEvent::Left { bus, address } => self.handle_device_left(bus, address),
            }
        }
    }

    /// Attached devices, sorted by bus id
    pub fn list_devices(&self) -> Vec<UsbDeviceSummary> {
        let mut devices: Vec<UsbDeviceSummary> = self
            .devices
            .iter()
            .map(|(busid, device)| device.summary(self.matcher.is_bound(busid)))
            .collect();
        devices.sort_by(|a, b| a.busid.cmp(&b.busid));
        devices
    }

    pub fn policy(&self) -> BindPolicy {
        self.policy
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn send_event(&self, event: HostEvent) {
        if let Err(e) = self.event_sender.try_send(event) {
            error!("Failed to send host event: {}", e);
        }
    }
}

/// Queues hot-plug notifications for the worker loop
///
/// libusb runs the callback inside `handle_events`, so it only forwards.
struct HotplugCallback {
    queue: async_channel::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.queue.try_send(HotplugEvent::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.queue.try_send(HotplugEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}
