//! USB transfer execution
//!
//! Runs one URB synchronously through rusb, reading into or writing from the
//! URB's own transfer buffer.

use common::{TransferKind, Urb, UrbError};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for USB transfers (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Execute `urb` and return the number of bytes transferred
pub fn execute_urb(
    handle: &DeviceHandle<Context>,
    urb: &mut Urb,
    timeout: Duration,
) -> Result<usize, UrbError> {
    let is_in = urb.is_in();
    let endpoint = urb.endpoint();
    let kind = urb.kind();

    let result = match kind {
        TransferKind::Control => {
            let setup = *urb.setup_packet().ok_or(UrbError::InvalidParam)?;
            execute_control(handle, setup, urb, timeout)
        }
        TransferKind::Bulk => {
            let buffer = urb.transfer_buffer_mut().ok_or(UrbError::InvalidParam)?;
            if is_in {
                handle.read_bulk(endpoint, &mut buffer[..], timeout)
            } else {
                handle.write_bulk(endpoint, &buffer[..], timeout)
            }
        }
        TransferKind::Interrupt => {
            let buffer = urb.transfer_buffer_mut().ok_or(UrbError::InvalidParam)?;
            if is_in {
                handle.read_interrupt(endpoint, &mut buffer[..], timeout)
            } else {
                handle.write_interrupt(endpoint, &buffer[..], timeout)
            }
        }
        TransferKind::Isochronous => {
            warn!("{}: isochronous transfers are not supported", urb.id());
            return Err(UrbError::Other(
                "isochronous transfers are not supported".to_string(),
            ));
        }
    };

    match result {
        Ok(len) => {
            debug!(
                "{:?} transfer {} on endpoint {:#x} succeeded: {} bytes",
                kind,
                urb.id(),
                endpoint,
                len
            );
            Ok(len)
        }
        Err(e) => {
            debug!(
                "{:?} transfer {} on endpoint {:#x} failed: {}",
                kind,
                urb.id(),
                endpoint,
                e
            );
            Err(map_rusb_error(e))
        }
    }
}

fn execute_control(
    handle: &DeviceHandle<Context>,
    setup: common::SetupPacket,
    urb: &mut Urb,
    timeout: Duration,
) -> rusb::Result<usize> {
    let request_type = setup[0];
    let request = setup[1];
    let value = u16::from_le_bytes([setup[2], setup[3]]);
    let index = u16::from_le_bytes([setup[4], setup[5]]);
    let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;

    let mut empty = Vec::new();
    let buffer = urb.transfer_buffer_mut().unwrap_or(&mut empty);
    let len = length.min(buffer.len());

    if (request_type & 0x80) != 0 {
        handle.read_control(
            request_type,
            request,
            value,
            index,
            &mut buffer[..len],
            timeout,
        )
    } else {
        handle.write_control(request_type, request, value, index, &buffer[..len], timeout)
    }
}

/// Map rusb::Error to the URB completion error
pub fn map_rusb_error(err: rusb::Error) -> UrbError {
    match err {
        rusb::Error::Timeout => UrbError::Timeout,
        rusb::Error::Pipe => UrbError::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => UrbError::NoDevice,
        rusb::Error::Busy => UrbError::Busy,
        rusb::Error::Overflow => UrbError::Overflow,
        rusb::Error::Io => UrbError::Io,
        rusb::Error::InvalidParam => UrbError::InvalidParam,
        rusb::Error::Access => UrbError::Access,
        rusb::Error::Interrupted => UrbError::Killed,
        _ => UrbError::Other(err.to_string()),
    }
}
