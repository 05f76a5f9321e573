//! Bus id registry
//!
//! Fixed-capacity table of bus identifiers that the host is allowed to
//! export, each with an export state. Slots are allocated first-fit and keep
//! stable indices, so a slot freed by `remove` is the next one `add` reuses.
//!
//! Every operation takes the single table lock for its whole body. Nothing
//! called under the lock blocks or touches a device pool.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Width of a bus id including its NUL terminator
pub const BUSID_SIZE: usize = 32;

/// Number of slots in the registry
pub const MAX_BUSID: usize = 16;

/// Bus identifier of a device attachment point, e.g. `1-1` or `3-2.4`
///
/// Holds 1 to `BUSID_SIZE - 1` bytes of UTF-8 without NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(String);

impl BusId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgument("empty bus id".to_string()));
        }
        if id.len() >= BUSID_SIZE {
            return Err(Error::InvalidArgument(format!(
                "bus id '{}' exceeds {} bytes",
                id,
                BUSID_SIZE - 1
            )));
        }
        if id.contains('\0') {
            return Err(Error::InvalidArgument(format!(
                "bus id '{}' contains NUL",
                id.escape_debug()
            )));
        }
        Ok(Self(id))
    }

    /// Parse a bus id from raw bytes (no terminator)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id = std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidArgument("bus id is not valid UTF-8".to_string()))?;
        Self::new(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BusId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for BusId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Export state of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusIdStatus {
    /// Not eligible; the zero state of every slot
    #[default]
    Unclaimed,
    /// Registered for export, no device bound
    Added,
    /// A device with this bus id is bound for export
    Allocated,
    /// Removed while bound; erased once the device is released
    PendingRemoval,
}

impl fmt::Display for BusIdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusIdStatus::Unclaimed => "unclaimed",
            BusIdStatus::Added => "added",
            BusIdStatus::Allocated => "allocated",
            BusIdStatus::PendingRemoval => "pending-removal",
        };
        f.write_str(s)
    }
}

/// Snapshot of one occupied slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusIdEntryRef {
    /// Stable slot index
    pub slot: usize,
    pub name: BusId,
    pub status: BusIdStatus,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    /// `None` marks the slot free
    name: Option<BusId>,
    status: BusIdStatus,
}

/// The bus id registry
#[derive(Debug)]
pub struct BusIdTable {
    slots: Mutex<[Slot; MAX_BUSID]>,
}

impl Default for BusIdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BusIdTable {
    /// Create a table with every slot free and `Unclaimed`
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| Slot::default())),
        }
    }

    fn slots(&self) -> MutexGuard<'_, [Slot; MAX_BUSID]> {
        // A panic under this lock cannot leave a slot half-written
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index of the occupied slot named `id`. Caller holds the lock.
    fn find(slots: &[Slot; MAX_BUSID], id: &BusId) -> Option<usize> {
        slots.iter().position(|s| s.name.as_ref() == Some(id))
    }

    /// Find the entry for `id`
    pub fn lookup(&self, id: &BusId) -> Option<BusIdEntryRef> {
        let slots = self.slots();
        Self::find(&slots, id).map(|slot| BusIdEntryRef {
            slot,
            name: id.clone(),
            status: slots[slot].status,
        })
    }

    /// Current export state of `id`
    pub fn status(&self, id: &BusId) -> Option<BusIdStatus> {
        self.lookup(id).map(|entry| entry.status)
    }

    /// Register `id` for export
    ///
    /// Adding an id that is already present succeeds without touching it.
    /// A reused slot whose previous status was `Allocated` or
    /// `PendingRemoval` keeps that status.
    pub fn add(&self, id: &BusId) -> Result<()> {
        let mut slots = self.slots();

        if Self::find(&slots, id).is_some() {
            debug!("bus id {} already registered", id);
            return Ok(());
        }

        let slot = slots
            .iter()
            .position(|s| s.name.is_none())
            .ok_or(Error::CapacityExceeded {
                capacity: MAX_BUSID,
            })?;

        let entry = &mut slots[slot];
        entry.name = Some(id.clone());
        if !matches!(
            entry.status,
            BusIdStatus::Allocated | BusIdStatus::PendingRemoval
        ) {
            entry.status = BusIdStatus::Added;
        }

        info!("Registered bus id {} in slot {} ({})", id, slot, entry.status);
        Ok(())
    }

    /// Unregister `id`
    ///
    /// `Unclaimed` entries are erased. `Allocated` and `PendingRemoval`
    /// entries become `PendingRemoval` and keep their name until the bound
    /// device is released. An `Added` entry is reported as removed but left
    /// exactly as it is.
    pub fn remove(&self, id: &BusId) -> Result<()> {
        let mut slots = self.slots();

        let slot = Self::find(&slots, id)
            .ok_or_else(|| Error::NotFound(format!("bus id {}", id)))?;

        let entry = &mut slots[slot];
        match entry.status {
            BusIdStatus::Unclaimed => {
                entry.name = None;
                info!("Erased bus id {} from slot {}", id, slot);
            }
            // TODO: decide with the product owner whether an Added entry
            // should be erased here; it is left untouched for now.
            BusIdStatus::Added => {
                debug!("bus id {} is added, leaving slot {} unchanged", id, slot);
            }
            BusIdStatus::Allocated | BusIdStatus::PendingRemoval => {
                entry.status = BusIdStatus::PendingRemoval;
                info!("Bus id {} marked for removal", id);
            }
        }

        Ok(())
    }

    /// Mark `id` as bound to a device (probe path)
    ///
    /// Only `Added` or `Allocated` entries can be claimed.
    pub fn claim(&self, id: &BusId) -> Result<()> {
        let mut slots = self.slots();

        let slot = Self::find(&slots, id)
            .ok_or_else(|| Error::NotFound(format!("bus id {}", id)))?;

        let entry = &mut slots[slot];
        match entry.status {
            BusIdStatus::Added | BusIdStatus::Allocated => {
                entry.status = BusIdStatus::Allocated;
                debug!("Claimed bus id {}", id);
                Ok(())
            }
            status => Err(Error::NotFound(format!(
                "bus id {} is not eligible for export ({})",
                id, status
            ))),
        }
    }

    /// Drop the claim on `id` (disconnect path)
    ///
    /// An `Allocated` entry goes back to `Added`. Any other status becomes
    /// `Unclaimed` and the entry is erased. Unknown ids are ignored.
    pub fn release(&self, id: &BusId) {
        let mut slots = self.slots();

        let Some(slot) = Self::find(&slots, id) else {
            debug!("release of unregistered bus id {}", id);
            return;
        };

        let entry = &mut slots[slot];
        if entry.status == BusIdStatus::Allocated {
            entry.status = BusIdStatus::Added;
            debug!("Released bus id {}", id);
        } else {
            entry.status = BusIdStatus::Unclaimed;
            entry.name = None;
            info!("Released and erased bus id {} from slot {}", id, slot);
        }
    }

    /// Names of all registered ids in table order
    pub fn enumerate(&self) -> Vec<BusId> {
        self.slots()
            .iter()
            .filter_map(|s| s.name.clone())
            .collect()
    }

    /// Snapshot of all occupied slots in table order
    pub fn entries(&self) -> Vec<BusIdEntryRef> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| {
                s.name.as_ref().map(|name| BusIdEntryRef {
                    slot,
                    name: name.clone(),
                    status: s.status,
                })
            })
            .collect()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots().iter().filter(|s| s.name.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn force_status(&self, id: &BusId, status: BusIdStatus) {
        let mut slots = self.slots();
        let slot = Self::find(&slots, id).unwrap();
        slots[slot].status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busid(s: &str) -> BusId {
        BusId::new(s).unwrap()
    }

    #[test]
    fn test_busid_validation() {
        assert!(BusId::new("1-1").is_ok());
        assert!(BusId::new("3-2.4.1").is_ok());
        assert!(BusId::new("").is_err());
        assert!(BusId::new("a".repeat(BUSID_SIZE - 1)).is_ok());
        assert!(BusId::new("a".repeat(BUSID_SIZE)).is_err());
        assert!(BusId::new("1-\0").is_err());
        assert!(BusId::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_new_table_is_empty() {
        let table = BusIdTable::new();
        assert!(table.is_empty());
        assert!(table.enumerate().is_empty());
        assert_eq!(table.lookup(&busid("1-1")), None);
    }

    #[test]
    fn test_add_is_idempotent() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        let before = table.entries();

        table.add(&busid("1-1")).unwrap();
        assert_eq!(table.entries(), before);
        assert_eq!(table.len(), 1);
        assert_eq!(table.status(&busid("1-1")), Some(BusIdStatus::Added));
    }

    #[test]
    fn test_add_does_not_reset_claimed_entry() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        table.claim(&busid("1-1")).unwrap();

        table.add(&busid("1-1")).unwrap();
        assert_eq!(table.status(&busid("1-1")), Some(BusIdStatus::Allocated));
    }

    #[test]
    fn test_capacity_exceeded() {
        let table = BusIdTable::new();
        for i in 0..MAX_BUSID {
            table.add(&busid(&format!("1-{}", i + 1))).unwrap();
        }
        let before = table.entries();

        let err = table.add(&busid("2-1")).unwrap_err();
        assert_eq!(err, Error::CapacityExceeded { capacity: 16 });
        assert_eq!(table.entries(), before);

        // Present ids still succeed on a full table
        table.add(&busid("1-5")).unwrap();
    }

    #[test]
    fn test_remove_unknown() {
        let table = BusIdTable::new();
        assert!(matches!(
            table.remove(&busid("9-9")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_unclaimed_frees_slot() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        table.add(&busid("1-2")).unwrap();
        table.force_status(&busid("1-1"), BusIdStatus::Unclaimed);

        table.remove(&busid("1-1")).unwrap();
        assert_eq!(table.enumerate(), vec![busid("1-2")]);

        // First-fit: slot 0 is reused
        table.add(&busid("4-4")).unwrap();
        assert_eq!(table.lookup(&busid("4-4")).unwrap().slot, 0);
        assert_eq!(table.enumerate(), vec![busid("4-4"), busid("1-2")]);
    }

    #[test]
    fn test_remove_added_is_left_untouched() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        let before = table.entries();

        table.remove(&busid("1-1")).unwrap();
        assert_eq!(table.entries(), before);
    }

    #[test]
    fn test_remove_allocated_marks_pending() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        table.claim(&busid("1-1")).unwrap();

        table.remove(&busid("1-1")).unwrap();
        let entry = table.lookup(&busid("1-1")).unwrap();
        assert_eq!(entry.status, BusIdStatus::PendingRemoval);
        assert_eq!(table.enumerate(), vec![busid("1-1")]);

        table.remove(&busid("1-1")).unwrap();
        assert_eq!(
            table.status(&busid("1-1")),
            Some(BusIdStatus::PendingRemoval)
        );
    }

    #[test]
    fn test_claim_rules() {
        let table = BusIdTable::new();
        assert!(table.claim(&busid("1-1")).is_err());

        table.add(&busid("1-1")).unwrap();
        table.claim(&busid("1-1")).unwrap();
        table.claim(&busid("1-1")).unwrap();

        table.remove(&busid("1-1")).unwrap();
        assert!(table.claim(&busid("1-1")).is_err());
    }

    #[test]
    fn test_release_paths() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        table.claim(&busid("1-1")).unwrap();
        table.release(&busid("1-1"));
        assert_eq!(table.status(&busid("1-1")), Some(BusIdStatus::Added));

        table.claim(&busid("1-1")).unwrap();
        table.remove(&busid("1-1")).unwrap();
        table.release(&busid("1-1"));
        assert_eq!(table.lookup(&busid("1-1")), None);
        assert!(table.is_empty());

        // Unknown ids are ignored
        table.release(&busid("7-7"));
    }

    #[test]
    fn test_end_to_end_register_delete_readd() {
        let table = BusIdTable::new();
        table.add(&busid("1-1")).unwrap();
        assert_eq!(table.enumerate(), vec![busid("1-1")]);

        table.force_status(&busid("1-1"), BusIdStatus::Unclaimed);
        table.remove(&busid("1-1")).unwrap();
        assert!(table.enumerate().is_empty());

        table.add(&busid("1-1")).unwrap();
        assert_eq!(table.enumerate(), vec![busid("1-1")]);
    }

    #[test]
    fn test_concurrent_adds_respect_capacity() {
        let table = std::sync::Arc::new(BusIdTable::new());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || table.add(&busid(&format!("{}-1", i))).is_ok())
            })
            .collect();

        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(succeeded, MAX_BUSID);
        assert_eq!(table.len(), MAX_BUSID);
    }
}
