//! `match_busid` text attribute
//!
//! Reading lists the registered bus ids. Writing `add <busid>` or
//! `del <busid>` registers or unregisters one.

use crate::busid::{BUSID_SIZE, BusId, BusIdTable};
use crate::error::Error;
use nix::errno::Errno;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const PREFIX_LEN: usize = 4;

/// Failure of a control write, carrying the errno reported to the writer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("no such device: {0}")]
    NoDevice(String),
}

impl ControlError {
    pub fn errno(&self) -> Errno {
        match self {
            ControlError::InvalidArgument(_) => Errno::EINVAL,
            ControlError::OutOfMemory(_) => Errno::ENOMEM,
            ControlError::NoDevice(_) => Errno::ENODEV,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchBusIdAttribute {
    registry: Arc<BusIdTable>,
}

impl MatchBusIdAttribute {
    pub fn new(registry: Arc<BusIdTable>) -> Self {
        Self { registry }
    }

    /// Every registered id followed by a space, then a newline
    pub fn show(&self) -> String {
        let mut out = String::new();
        for id in self.registry.enumerate() {
            out.push_str(id.as_str());
            out.push(' ');
        }
        out.push('\n');
        out
    }

    /// Apply one `add ` / `del ` write, returning the bytes consumed
    pub fn store(&self, buf: &[u8]) -> Result<usize, ControlError> {
        if buf.len() < PREFIX_LEN + 1 {
            return Err(ControlError::InvalidArgument(format!(
                "write of {} bytes is too short",
                buf.len()
            )));
        }

        let (prefix, rest) = buf.split_at(PREFIX_LEN);
        let id_len = rest
            .iter()
            .take(BUSID_SIZE)
            .position(|&b| b == 0)
            .unwrap_or(rest.len().min(BUSID_SIZE));
        if id_len >= BUSID_SIZE {
            return Err(ControlError::InvalidArgument(format!(
                "bus id longer than {} bytes",
                BUSID_SIZE - 1
            )));
        }

        let id = BusId::from_bytes(&rest[..id_len]).map_err(|e| match e {
            Error::InvalidArgument(message) => ControlError::InvalidArgument(message),
            other => ControlError::InvalidArgument(other.to_string()),
        })?;

        match prefix {
            b"add " => {
                self.registry
                    .add(&id)
                    .map_err(|e| ControlError::OutOfMemory(e.to_string()))?;
                debug!("add busid {}", id);
            }
            b"del " => {
                self.registry
                    .remove(&id)
                    .map_err(|e| ControlError::NoDevice(e.to_string()))?;
                debug!("del busid {}", id);
            }
            _ => {
                return Err(ControlError::InvalidArgument(format!(
                    "unknown operation '{}'",
                    String::from_utf8_lossy(prefix).trim_end()
                )));
            }
        }

        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busid::{BusIdStatus, MAX_BUSID};

    fn setup() -> (Arc<BusIdTable>, MatchBusIdAttribute) {
        let registry = Arc::new(BusIdTable::new());
        (registry.clone(), MatchBusIdAttribute::new(registry))
    }

    #[test]
    fn test_show_empty() {
        let (_, attr) = setup();
        assert_eq!(attr.show(), "\n");
    }

    #[test]
    fn test_add_show_del() {
        let (registry, attr) = setup();

        assert_eq!(attr.store(b"add 1-1"), Ok(7));
        assert_eq!(attr.store(b"add 2-1.3"), Ok(9));
        assert_eq!(attr.show(), "1-1 2-1.3 \n");

        assert_eq!(attr.store(b"del 2-1.3"), Ok(9));
        assert_eq!(
            registry.status(&BusId::new("2-1.3").unwrap()),
            Some(BusIdStatus::Added)
        );
    }

    #[test]
    fn test_short_write_rejected() {
        let (registry, attr) = setup();
        for buf in [&b""[..], b"add", b"add "] {
            let err = attr.store(buf).unwrap_err();
            assert_eq!(err.errno(), Errno::EINVAL);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_id_stops_at_nul() {
        let (registry, attr) = setup();
        assert_eq!(attr.store(b"add 1-4\0garbage"), Ok(15));
        assert_eq!(registry.enumerate(), vec![BusId::new("1-4").unwrap()]);
    }

    #[test]
    fn test_id_length_limit() {
        let (registry, attr) = setup();

        let mut longest = b"add ".to_vec();
        longest.extend(std::iter::repeat_n(b'1', BUSID_SIZE - 1));
        assert!(attr.store(&longest).is_ok());

        let mut too_long = b"add ".to_vec();
        too_long.extend(std::iter::repeat_n(b'2', BUSID_SIZE));
        assert_eq!(attr.store(&too_long).unwrap_err().errno(), Errno::EINVAL);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        let (registry, attr) = setup();
        let err = attr.store(b"put 1-1").unwrap_err();
        assert_eq!(err.errno(), Errno::EINVAL);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_or_invalid_utf8_id_rejected() {
        let (registry, attr) = setup();
        assert_eq!(attr.store(b"add \0").unwrap_err().errno(), Errno::EINVAL);
        assert_eq!(
            attr.store(b"add \xff\xfe").unwrap_err().errno(),
            Errno::EINVAL
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_full_table_maps_to_enomem() {
        let (_, attr) = setup();
        for n in 0..MAX_BUSID {
            attr.store(format!("add 1-{}", n).as_bytes()).unwrap();
        }
        let err = attr.store(b"add 9-9").unwrap_err();
        assert_eq!(err.errno(), Errno::ENOMEM);
    }

    #[test]
    fn test_del_unknown_maps_to_enodev() {
        let (_, attr) = setup();
        let err = attr.store(b"del 1-1").unwrap_err();
        assert_eq!(err.errno(), Errno::ENODEV);
    }
}
