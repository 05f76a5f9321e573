//! Fixed-capacity object caches backing the request pools
//!
//! An [`ObjectCache`] hands out [`CacheObject`]s from a bounded slot table
//! and takes them back with [`ObjectCache::free`]. Freeing consumes the
//! object, so returning it twice does not type-check. An object dropped
//! without being freed still returns its slot, with a warning, so a lost
//! object never shrinks the cache. Both paths take only a spin lock over the
//! slot table and are safe from completion context.

use crate::error::{Error, Result};
use slab::Slab;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Counters of one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub capacity: usize,
    pub live: usize,
    pub allocated: usize,
    /// Slots returned through [`ObjectCache::free`]
    pub freed: usize,
    /// Slots returned because their object was dropped instead of freed
    pub reclaimed: usize,
}

/// Slot table shared by a cache and every object it handed out
struct SlotTable {
    name: &'static str,
    slots: spin::Mutex<Slab<()>>,
    freed: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl SlotTable {
    fn release(&self, slot: usize) -> bool {
        self.slots.lock().try_remove(slot).is_some()
    }
}

/// Typed fixed-capacity allocator
pub struct ObjectCache<T> {
    capacity: usize,
    table: Arc<SlotTable>,
    allocated: AtomicUsize,
    _marker: PhantomData<fn() -> T>,
}

/// Claim on one slot; gives the slot back if the object is dropped
struct SlotLease {
    slot: usize,
    table: Arc<SlotTable>,
    released: bool,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "object in slot {} of cache {} dropped without being freed, reclaiming",
            self.slot, self.table.name
        );
        if self.table.release(self.slot) {
            self.table.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// An object owned through an [`ObjectCache`] slot
#[must_use = "a cache object should be returned with ObjectCache::free"]
pub struct CacheObject<T> {
    lease: SlotLease,
    value: T,
}

impl<T> CacheObject<T> {
    /// Slot index inside the owning cache
    pub fn slot(&self) -> usize {
        self.lease.slot
    }
}

impl<T> Deref for CacheObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CacheObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CacheObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheObject")
            .field("slot", &self.lease.slot)
            .field("value", &self.value)
            .finish()
    }
}

impl<T> ObjectCache<T> {
    /// Create a cache of `capacity` objects
    pub fn new(name: &'static str, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::AllocationFailure(format!(
                "cache {} created with zero capacity",
                name
            )));
        }

        debug!("Created object cache {} ({} objects)", name, capacity);
        Ok(Self {
            capacity,
            table: Arc::new(SlotTable {
                name,
                slots: spin::Mutex::new(Slab::with_capacity(capacity)),
                freed: AtomicUsize::new(0),
                reclaimed: AtomicUsize::new(0),
            }),
            allocated: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &'static str {
        self.table.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Place `value` in a free slot
    pub fn alloc(&self, value: T) -> Result<CacheObject<T>> {
        let slot = {
            let mut slots = self.table.slots.lock();
            if slots.len() >= self.capacity {
                return Err(Error::AllocationFailure(format!(
                    "cache {} exhausted ({} objects)",
                    self.table.name, self.capacity
                )));
            }
            slots.insert(())
        };

        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(CacheObject {
            lease: SlotLease {
                slot,
                table: self.table.clone(),
                released: false,
            },
            value,
        })
    }

    /// Return an object's slot and hand back its contents
    ///
    /// An object of another cache goes back to the cache that allocated it.
    pub fn free(&self, object: CacheObject<T>) -> T {
        let CacheObject { mut lease, value } = object;
        lease.released = true;

        if !Arc::ptr_eq(&lease.table, &self.table) {
            warn!(
                "object from cache {} freed to {} (slot {}), returning it to its owner",
                lease.table.name, self.table.name, lease.slot
            );
            lease.table.release(lease.slot);
            lease.table.freed.fetch_add(1, Ordering::Relaxed);
            return value;
        }

        if self.table.release(lease.slot) {
            self.table.freed.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!("slot {} of cache {} was already free", lease.slot, self.table.name);
        }
        value
    }

    /// Objects currently allocated
    pub fn live(&self) -> usize {
        self.table.slots.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            live: self.live(),
            allocated: self.allocated.load(Ordering::Relaxed),
            freed: self.table.freed.load(Ordering::Relaxed),
            reclaimed: self.table.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Tear the cache down, reporting objects that were never freed
    pub fn destroy(self) -> CacheStats {
        let stats = self.stats();
        if stats.live > 0 {
            warn!(
                "destroying cache {} with {} live objects",
                self.table.name, stats.live
            );
        } else {
            debug!(
                "Destroyed object cache {} ({} allocations)",
                self.table.name, stats.allocated
            );
        }
        stats
    }
}

impl<T> fmt::Debug for ObjectCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("name", &self.table.name)
            .field("stats", &self.stats())
            .finish()
    }
}
