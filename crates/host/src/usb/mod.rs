//! USB subsystem
//!
//! Enumerates attached devices, follows hot-plug and binds registered
//! devices for export. Everything here runs on the dedicated worker thread
//! so libusb never blocks the Tokio runtime.

pub mod backend;
pub mod device;
pub mod manager;
pub mod transfers;
pub mod worker;

pub use backend::RusbBackend;
pub use device::{UsbDevice, busid_of, format_busid};
pub use manager::{BindPolicy, DeviceManager};
pub use worker::{UsbWorkerThread, spawn_usb_worker};
