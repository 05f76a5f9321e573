//! Host core error types

use thiserror::Error;

/// Errors returned by the registry, the object caches and the pools
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Every bus id slot is occupied
    #[error("bus id table is full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    /// Identifier unknown to the registry, or device absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed identifier or control input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Object cache could not be created or is exhausted
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    /// libusb failure while binding a device
    #[error("USB error: {0}")]
    Usb(String),
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        Error::Usb(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
