//! Common utilities for mausb-host
//!
//! This crate provides the pieces shared by the host daemon and its tests:
//! the USB request block (URB) abstraction and the hardware backend seam,
//! error handling, logging setup, and the async channel bridge between the
//! Tokio runtime and the USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{HostBridge, HostCommand, HostEvent, HostWorker, create_host_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{
    SetupPacket, TransferKind, Urb, UrbBackend, UrbError, UrbId, UrbStatus, UsbDeviceSummary,
};
