//! USB request block (URB) abstraction and the hardware backend seam
//!
//! A [`Urb`] is the hardware transfer-request handle owned by a pooled
//! request object. It exclusively owns its transfer buffer and setup packet;
//! both are released through [`Urb::release_buffers`] before the handle
//! itself is handed back to the [`UrbBackend`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 8-byte control transfer setup packet
pub type SetupPacket = [u8; 8];

/// Identifier of a URB, unique per backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UrbId(pub u64);

impl fmt::Display for UrbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urb#{}", self.0)
    }
}

/// USB transfer type carried by a URB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Errors reported by the hardware layer for a single URB
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrbError {
    #[error("device disconnected")]
    NoDevice,
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer timed out")]
    Timeout,
    #[error("resource busy")]
    Busy,
    #[error("transfer overflow")]
    Overflow,
    #[error("I/O error")]
    Io,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("access denied")]
    Access,
    #[error("URB was killed")]
    Killed,
    #[error("{0}")]
    Other(String),
}

/// Completion state of a URB
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UrbStatus {
    /// Allocated, not submitted yet
    #[default]
    Idle,
    /// Handed to the hardware, completion outstanding
    InFlight,
    /// Completed successfully
    Completed { actual_length: usize },
    /// Completed with an error
    Failed(UrbError),
    /// Killed before or during execution
    Killed,
}

/// Hardware transfer-request handle
#[derive(Debug)]
pub struct Urb {
    id: UrbId,
    kind: TransferKind,
    endpoint: u8,
    transfer_buffer: Option<Vec<u8>>,
    setup_packet: Option<Box<SetupPacket>>,
    status: UrbStatus,
}

impl Urb {
    pub fn new(id: UrbId, kind: TransferKind, endpoint: u8) -> Self {
        Self {
            id,
            kind,
            endpoint,
            transfer_buffer: None,
            setup_packet: None,
            status: UrbStatus::Idle,
        }
    }

    /// Attach a transfer buffer (data to send, or capacity to receive into)
    pub fn with_transfer_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.transfer_buffer = Some(buffer);
        self
    }

    /// Attach a control setup packet
    pub fn with_setup_packet(mut self, setup: SetupPacket) -> Self {
        self.setup_packet = Some(Box::new(setup));
        self
    }

    pub fn id(&self) -> UrbId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Direction bit of the endpoint (or of bmRequestType for control)
    pub fn is_in(&self) -> bool {
        match (self.kind, self.setup_packet.as_deref()) {
            (TransferKind::Control, Some(setup)) => setup[0] & 0x80 != 0,
            _ => self.endpoint & 0x80 != 0,
        }
    }

    pub fn transfer_buffer(&self) -> Option<&[u8]> {
        self.transfer_buffer.as_deref()
    }

    pub fn transfer_buffer_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.transfer_buffer.as_mut()
    }

    pub fn setup_packet(&self) -> Option<&SetupPacket> {
        self.setup_packet.as_deref()
    }

    pub fn status(&self) -> &UrbStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: UrbStatus) {
        self.status = status;
    }

    /// Whether the URB still owns a transfer buffer or setup packet
    pub fn has_buffers(&self) -> bool {
        self.transfer_buffer.is_some() || self.setup_packet.is_some()
    }

    /// Release the transfer buffer and setup packet
    ///
    /// Returns how many buffers were released. Calling it again releases
    /// nothing.
    pub fn release_buffers(&mut self) -> usize {
        let mut released = 0;
        if self.transfer_buffer.take().is_some() {
            released += 1;
        }
        if self.setup_packet.take().is_some() {
            released += 1;
        }
        released
    }
}

/// Physical USB transport that executes and cancels URBs
///
/// Implementations must make [`UrbBackend::kill`] idempotent: killing a URB
/// that already completed or was killed before is a no-op. `kill` may block
/// until a concurrently running completion for the same URB has finished, so
/// callers must never invoke it while holding a pool lock.
pub trait UrbBackend: Send + Sync {
    /// Hand a URB to the hardware
    fn submit(&self, urb: &mut Urb) -> Result<(), UrbError>;

    /// Synchronously cancel a URB
    ///
    /// A URB that was still in flight is left in [`UrbStatus::Killed`].
    fn kill(&self, urb: &mut Urb);

    /// Release the URB handle itself
    fn free(&self, urb: Urb);
}

/// Summary of an attached USB device as seen by the host daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceSummary {
    /// Bus identifier, `<bus>-<port>[.<port>...]`
    pub busid: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    /// Whether the device is currently bound for export
    pub exported: bool,
}
