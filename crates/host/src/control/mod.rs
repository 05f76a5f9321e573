//! Control surface
//!
//! The `match_busid` attribute edits the bus id registry; the command
//! channel starts and stops the helper programs around an export. The
//! daemon serves both over Unix sockets.

pub mod attribute;
pub mod command;
pub mod server;

pub use attribute::{ControlError, MatchBusIdAttribute};
pub use command::{CommandChannel, HelperCommand, HelperInvocation, ProcessLauncher, SpawnLauncher};
pub use server::{ControlHandler, EndpointHandle, EndpointKind, serve};
