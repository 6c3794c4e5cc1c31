// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pinned-region registry (§4.B). An id-indexed free-list table, the same
// shape as the chunk free-list used for the large-message path in the
// teacher's storage pool: a `Vec<Slot>` plus a singly-linked free chain of
// indexes, except here each slot holds application memory pages instead of
// shared-memory chunk storage, and release is refcounted rather than
// connection-bitmask-counted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::rw_lock::RwLock;

/// One page-aligned segment of application memory made available for
/// zero-copy DMA. Represented here as an owned byte buffer standing in for
/// pinned pages (real page pinning is the host OS's job, out of scope).
#[derive(Clone)]
pub struct Segment {
    pub offset: u32,
    pub bytes: Arc<PinnedBytes>,
}

/// Byte storage shared by all acquirers of one region, guarded by the same
/// `RwLock` primitive `pull::PullHandleTable` uses for its handle set: a
/// pull-reply *send* (`append_pages_to_frame`) takes the shared lock since
/// several responses may read disjoint ranges concurrently, a pull-reply
/// *receive* (`fill_pages_from_frame`) takes the exclusive lock since it
/// writes. Every access to `bytes` happens while holding `lock`, matching
/// `PullHandleTable`'s own `UnsafeCell`-guarded-by-lock contract.
pub struct PinnedBytes {
    lock: RwLock,
    bytes: std::cell::UnsafeCell<Vec<u8>>,
}

// SAFETY: `bytes` is only ever read through `lock.lock_shared()` and only
// ever written through `lock.lock()`; see the struct-level contract above.
unsafe impl Send for PinnedBytes {}
unsafe impl Sync for PinnedBytes {}

impl PinnedBytes {
    fn new(v: Vec<u8>) -> Self {
        PinnedBytes {
            lock: RwLock::new(),
            bytes: std::cell::UnsafeCell::new(v),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.lock.lock_shared();
        let r = f(unsafe { &*self.bytes.get() });
        self.lock.unlock_shared();
        r
    }

    fn write(&self, f: impl FnOnce(&mut [u8])) {
        self.lock.lock();
        f(unsafe { &mut *self.bytes.get() });
        self.lock.unlock();
    }
}

struct RegionEntry {
    seqnum: u32,
    length: u32,
    bytes: Arc<PinnedBytes>,
    refcount: Arc<AtomicU32>,
}

enum Slot {
    Free { next: u32 },
    Occupied(RegionEntry),
}

/// The pinned-region table owned by one endpoint. Bounded at
/// `Config::user_region_max` live entries.
pub struct RegionTable {
    slots: Vec<Slot>,
    free_head: u32,
    capacity: u32,
}

const NIL: u32 = u32::MAX;

impl RegionTable {
    pub fn new(capacity: u16) -> Self {
        let capacity = capacity as u32;
        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let next = if i + 1 < capacity { i + 1 } else { NIL };
            slots.push(Slot::Free { next });
        }
        RegionTable {
            slots,
            free_head: if capacity == 0 { NIL } else { 0 },
            capacity,
        }
    }

    /// Pin `segments` (here: a single contiguous byte range of `length`
    /// bytes) and return a stable region id.
    pub fn register(&mut self, length: u32) -> Result<u32, Error> {
        if self.free_head == NIL {
            return Err(Error::RegionTableFull);
        }
        let id = self.free_head;
        let next = match &self.slots[id as usize] {
            Slot::Free { next } => *next,
            Slot::Occupied(_) => unreachable!("free list corrupt"),
        };
        self.free_head = next;

        let seqnum = match &self.slots[id as usize] {
            Slot::Occupied(e) => e.seqnum.wrapping_add(1),
            Slot::Free { .. } => 0,
        };

        self.slots[id as usize] = Slot::Occupied(RegionEntry {
            seqnum,
            length,
            bytes: Arc::new(PinnedBytes::new(vec![0u8; length as usize])),
            refcount: Arc::new(AtomicU32::new(0)),
        });

        log::debug!("region {id} registered, {length} bytes");
        Ok(id)
    }

    /// Atomically bump the refcount and return a handle, or `BadRegionId`
    /// if the id is absent.
    pub fn acquire(&self, region_id: u32) -> Result<RegionHandle, Error> {
        let entry = match self.slots.get(region_id as usize) {
            Some(Slot::Occupied(e)) => e,
            _ => return Err(Error::BadRegionId(region_id)),
        };
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(RegionHandle {
            id: region_id,
            seqnum: entry.seqnum,
            length: entry.length,
            bytes: entry.bytes.clone(),
            refcount: entry.refcount.clone(),
        })
    }

    /// Unpin and free the slot for `region_id` if its refcount is zero.
    /// Called automatically when the last [`RegionHandle`] drops; exposed
    /// for explicit application-driven deregistration.
    pub fn release_if_unused(&mut self, region_id: u32) {
        if let Some(Slot::Occupied(e)) = self.slots.get(region_id as usize) {
            if e.refcount.load(Ordering::Acquire) == 0 {
                self.slots[region_id as usize] = Slot::Free {
                    next: self.free_head,
                };
                self.free_head = region_id;
                log::debug!("region {region_id} unpinned");
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A refcounted reference to a pinned region, acquired via
/// [`RegionTable::acquire`]. Dropping the last handle does not itself free
/// the slot (the table needs `&mut self` for that); callers call
/// [`RegionTable::release_if_unused`] after dropping handles that might
/// have been last, matching the source's deferred-unpin-on-last-release
/// note in §4.B.
#[derive(Clone)]
pub struct RegionHandle {
    pub id: u32,
    pub seqnum: u32,
    pub length: u32,
    bytes: Arc<PinnedBytes>,
    refcount: Arc<AtomicU32>,
}

impl RegionHandle {
    /// For pull-reply send: read `length` bytes starting at `region_offset`
    /// under the region's shared lock. Several responses may read disjoint
    /// (or even overlapping) ranges of the same region concurrently, so
    /// this takes `lock_shared`, not `lock`.
    pub fn append_pages_to_frame(&self, region_offset: u32, length: u32) -> Result<Vec<u8>, Error> {
        let start = region_offset as usize;
        let end = start + length as usize;
        self.bytes
            .read(|data| data.get(start..end).map(|s| s.to_vec()))
            .ok_or(Error::InternalMiscEinval)
    }

    /// For pull-reply receive: copy `payload` into the region at
    /// `region_offset`, under the region's exclusive lock.
    pub fn fill_pages_from_frame(&self, region_offset: u32, payload: &[u8]) -> Result<(), Error> {
        let start = region_offset as usize;
        let end = start + payload.len();
        if end as u32 > self.length {
            return Err(Error::InternalMiscEinval);
        }
        self.bytes.write(|dst| dst[start..end].copy_from_slice(payload));
        Ok(())
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_acquire_release_roundtrip() {
        let mut table = RegionTable::new(4);
        let id = table.register(1024).unwrap();
        let handle = table.acquire(id).unwrap();
        handle.fill_pages_from_frame(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(handle.append_pages_to_frame(0, 4).unwrap(), vec![1, 2, 3, 4]);
        drop(handle);
        table.release_if_unused(id);
        // slot reusable now
        let id2 = table.register(64).unwrap();
        assert_eq!(id2, id);
    }

    #[test]
    fn table_full_errors() {
        let mut table = RegionTable::new(1);
        table.register(1).unwrap();
        assert!(matches!(table.register(1), Err(Error::RegionTableFull)));
    }

    #[test]
    fn bad_id_errors() {
        let table = RegionTable::new(1);
        assert!(matches!(table.acquire(5), Err(Error::BadRegionId(5))));
    }
}
