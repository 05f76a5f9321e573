//! mausb-host
//!
//! Host-side control plane for exporting local USB devices over a network
//! transport. The crate keeps the registry of bus ids that may be exported,
//! the per-device request pools, the teardown drain that returns every
//! pooled object to its cache, and the user-space control endpoints.

pub mod busid;
pub mod cache;
pub mod config;
pub mod control;
pub mod device;
pub mod drain;
pub mod error;
pub mod matcher;
pub mod module;
pub mod pool;
pub mod service;
pub mod usb;

pub use busid::{BUSID_SIZE, BusId, BusIdStatus, BusIdTable, MAX_BUSID};
pub use device::{ExportedDevice, Pipeline, PoolCaches, TransferRequest, TransportWrapper};
pub use drain::{DrainReport, drain_and_release};
pub use error::{Error, Result};
pub use matcher::DeviceMatcher;
pub use module::{HostModule, ShutdownReport};
pub use pool::{RequestPool, RequestState, WrapperState};
