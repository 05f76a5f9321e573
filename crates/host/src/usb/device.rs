//! USB device abstraction
//!
//! Wraps a `rusb::Device` with its cached descriptor and bus id, and opens
//! it for export by detaching kernel drivers and claiming its interfaces.

use crate::busid::BusId;
use crate::error::{Error, Result};
use common::UsbDeviceSummary;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use tracing::{debug, warn};

/// Format the bus id of a device at `bus` behind `ports`
///
/// Root hubs have no port chain and get no bus id.
pub fn format_busid(bus: u8, ports: &[u8]) -> Option<String> {
    let (first, rest) = ports.split_first()?;
    let mut busid = format!("{}-{}", bus, first);
    for port in rest {
        busid.push('.');
        busid.push_str(&port.to_string());
    }
    Some(busid)
}

/// Bus id of an attached device
pub fn busid_of<T: UsbContext>(device: &Device<T>) -> Option<BusId> {
    let ports = device.port_numbers().ok()?;
    let busid = format_busid(device.bus_number(), &ports)?;
    BusId::new(busid).ok()
}

/// USB device wrapper with cached information
pub struct UsbDevice {
    device: Device<Context>,
    busid: BusId,
    descriptor: DeviceDescriptor,
}

impl UsbDevice {
    /// Wrap `device`, reading its descriptor and bus id
    pub fn new(device: Device<Context>) -> Result<Self> {
        let busid = busid_of(&device).ok_or_else(|| {
            Error::NotFound(format!(
                "no bus id for device at bus {} address {}",
                device.bus_number(),
                device.address()
            ))
        })?;
        let descriptor = device.device_descriptor()?;

        Ok(Self {
            device,
            busid,
            descriptor,
        })
    }

    pub fn busid(&self) -> &BusId {
        &self.busid
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn device_address(&self) -> u8 {
        self.device.address()
    }

    pub fn summary(&self, exported: bool) -> UsbDeviceSummary {
        UsbDeviceSummary {
            busid: self.busid.to_string(),
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bus_number: self.bus_number(),
            device_address: self.device_address(),
            exported,
        }
    }

    /// Open the device for export
    ///
    /// Detaches kernel drivers from every interface of the active
    /// configuration and claims them. On failure every interface claimed so
    /// far is handed back.
    pub fn open(&self) -> Result<OpenedDevice> {
        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", self.busid, e);
            Error::from(e)
        })?;

        debug!("Opened device {}", self.busid);

        let config = self.device.active_config_descriptor().map_err(|e| {
            warn!("Failed to get active config descriptor: {}", e);
            Error::from(e)
        })?;

        let mut opened = OpenedDevice {
            busid: self.busid.clone(),
            handle,
            claimed_interfaces: Vec::new(),
        };

        for interface in config.interfaces() {
            let interface_number = interface.number();

            match opened.handle.kernel_driver_active(interface_number) {
                Ok(true) => {
                    debug!(
                        "Detaching kernel driver from interface {} on device {}",
                        interface_number, self.busid
                    );
                    if let Err(e) = opened.handle.detach_kernel_driver(interface_number) {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface_number, e
                        );
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(
                        "Could not check kernel driver status for interface {}: {}",
                        interface_number, e
                    );
                }
            }

            // Dropping `opened` releases what was claimed so far
            opened.handle.claim_interface(interface_number).map_err(|e| {
                warn!("Failed to claim interface {}: {}", interface_number, e);
                Error::from(e)
            })?;

            debug!("Claimed interface {} on device {}", interface_number, self.busid);
            opened.claimed_interfaces.push(interface_number);
        }

        Ok(opened)
    }
}

/// An opened device with its claimed interfaces
///
/// Dropping it releases the interfaces and reattaches kernel drivers.
pub struct OpenedDevice {
    busid: BusId,
    handle: DeviceHandle<Context>,
    claimed_interfaces: Vec<u8>,
}

impl OpenedDevice {
    pub fn busid(&self) -> &BusId {
        &self.busid
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }
}

impl Drop for OpenedDevice {
    fn drop(&mut self) {
        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = self.handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }

            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                    interface, e
                );
            }
        }
        debug!("Closed device {}", self.busid);
    }
}
