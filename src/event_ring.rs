// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Event ring pair (§4.C) — the single most delicate part of the core.
//
// Grounded on two teacher patterns:
//   - the ring-slot id/generation scheme in `channel.rs` (`RingSlot::size`
//     as an atomic "is this slot ready" flag, stamped last);
//   - the adaptive-backoff spin lock in `spin_lock.rs`, reused here for the
//     release-cursor lock instead of a blocking `Mutex`, since the producer
//     side must never block on the consumer.
//
// Producer protocol, exactly as specified:
//   1. fetch_add `next` -> logical position p
//   2. offset = p % capacity, id = (p % MAX_ID) + 1
//   3. if offset == last_free_offset, ring full: revert `next`, return Busy
//   4. memcpy body into slot
//   5. release fence, store id
//   6. wake waiters
//
// Consumer protocol: scan from a local cursor; id == 0 ends the scan;
// `release_chunk` advances `last_free_offset` without colliding with `next`.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use crate::spin_lock::adaptive_yield_pub as adaptive_yield;

/// Slot ids cycle through 1..=MAX_ID; 0 is reserved for "empty".
pub const MAX_ID: u32 = 255;

/// How many slots `release_chunk` advances at a time.
pub const RELEASE_CHUNK: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Posted { id: u8 },
    Busy,
}

struct Slot<T> {
    id: AtomicU8,
    body: std::cell::UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Slot {
            id: AtomicU8::new(0),
            body: std::cell::UnsafeCell::new(None),
        }
    }
}

// SAFETY: access to `body` is gated by the id field's acquire/release
// protocol below — a writer only touches a slot it just reserved and no
// other writer can reserve the same slot until it wraps back around after
// `capacity` productions, by which point the consumer has necessarily
// observed and retired the prior body.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// A fixed-capacity single-producer-class event ring, carrying fixed-size
/// event bodies of type `T` from the privileged half to the library.
pub struct EventRing<T> {
    slots: Box<[Slot<T>]>,
    capacity: u32,
    next: AtomicU32,
    last_free_offset: AtomicU32,
    release_lock: crate::spin_lock::SpinLock,
    overflow: AtomicU64,
    waiters: Mutex<()>,
    cv: Condvar,
}

impl<T> EventRing<T> {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot::empty());
        }
        EventRing {
            slots: slots.into_boxed_slice(),
            capacity,
            next: AtomicU32::new(0),
            last_free_offset: AtomicU32::new(capacity - 1),
            release_lock: crate::spin_lock::SpinLock::new(),
            overflow: AtomicU64::new(0),
            waiters: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Producer protocol. Returns the id stamped so a two-phase caller
    /// (unexpected ring) can correlate it with a reserved recvq slot.
    pub fn notify(&self, body: T) -> NotifyOutcome {
        let p = self.next.fetch_add(1, Ordering::AcqRel);
        let offset = p % self.capacity;
        if offset == self.last_free_offset.load(Ordering::Acquire) {
            self.next.fetch_sub(1, Ordering::AcqRel);
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return NotifyOutcome::Busy;
        }

        let id = ((p % MAX_ID) + 1) as u8;
        let slot = &self.slots[offset as usize];
        // SAFETY: this producer exclusively owns `offset` until it stamps
        // `id`; no other producer can reach the same offset before this one
        // wraps, and the consumer only reads `body` after observing `id`.
        unsafe {
            *slot.body.get() = Some(body);
        }
        // Release fence: the id store below must not be reordered before
        // the body write above, and consumers acquiring `id` must observe
        // the write.
        slot.id.store(id, Ordering::Release);

        let _guard = self.waiters.lock().unwrap();
        self.cv.notify_all();
        drop(_guard);

        NotifyOutcome::Posted { id }
    }

    /// Consumer protocol: read the slot `cursor` points at if its id has
    /// been stamped, advancing `cursor` on success. Returns `None` when the
    /// ring is caught up (id == 0, "no event").
    pub fn poll(&self, cursor: &mut u32) -> Option<T> {
        let offset = *cursor % self.capacity;
        let slot = &self.slots[offset as usize];
        let id = slot.id.load(Ordering::Acquire);
        if id == 0 {
            return None;
        }
        // SAFETY: the Acquire load above synchronizes-with the producer's
        // Release store of the same id, so the body write is visible here.
        let body = unsafe { (*slot.body.get()).take() };
        slot.id.store(0, Ordering::Relaxed);
        *cursor += 1;
        body
    }

    /// Advance `last_free_offset` by [`RELEASE_CHUNK`] slots, stopping one
    /// slot short of the producer cursor if it would otherwise collide.
    pub fn release_chunk(&self) {
        self.release_lock.lock();
        let next = self.next.load(Ordering::Acquire);
        let mut freed = self.last_free_offset.load(Ordering::Relaxed);
        for _ in 0..RELEASE_CHUNK {
            let candidate = (freed + 1) % self.capacity;
            if candidate == next % self.capacity {
                break;
            }
            freed = candidate;
        }
        self.last_free_offset.store(freed, Ordering::Release);
        self.release_lock.unlock();
    }

    /// Block the calling thread until a new event is published or
    /// `timeout` elapses. `waitspin` causes a short adaptive spin before
    /// parking, matching `OMX_WAITSPIN`.
    pub fn wait(&self, timeout: std::time::Duration, waitspin: bool) {
        if waitspin {
            let mut k = 0u32;
            let deadline = std::time::Instant::now() + std::time::Duration::from_micros(50);
            while std::time::Instant::now() < deadline {
                adaptive_yield(&mut k);
            }
        }
        let guard = self.waiters.lock().unwrap();
        let _ = self.cv.wait_timeout(guard, timeout);
    }

    pub fn wakeup(&self) {
        let _guard = self.waiters.lock().unwrap();
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_then_consume_in_order() {
        let ring: EventRing<u32> = EventRing::new(4);
        assert!(matches!(ring.notify(1), NotifyOutcome::Posted { .. }));
        assert!(matches!(ring.notify(2), NotifyOutcome::Posted { .. }));
        let mut cur = 0;
        assert_eq!(ring.poll(&mut cur), Some(1));
        assert_eq!(ring.poll(&mut cur), Some(2));
        assert_eq!(ring.poll(&mut cur), None);
    }

    #[test]
    fn full_ring_reports_busy_and_reverts_next() {
        let ring: EventRing<u32> = EventRing::new(2);
        // capacity 2: last_free_offset starts at 1, so offset 0 (p=0) is ok,
        // offset 1 (p=1) collides with last_free_offset == 1 -> busy.
        assert!(matches!(ring.notify(1), NotifyOutcome::Posted { .. }));
        assert!(matches!(ring.notify(2), NotifyOutcome::Busy));
        assert_eq!(ring.overflow_count(), 1);
        // consumer drains and releases, producer can proceed again
        let mut cur = 0;
        assert_eq!(ring.poll(&mut cur), Some(1));
        ring.release_chunk();
        assert!(matches!(ring.notify(3), NotifyOutcome::Posted { .. }));
    }

    #[test]
    fn id_stamping_observes_prior_body_write() {
        // Property test #4: a consumer observing slot.id == expected also
        // observes the body written before the id store. Exercised across
        // many iterations from a producer thread to catch reordering.
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(EventRing::<u64>::new(64));
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    loop {
                        if matches!(ring.notify(i), NotifyOutcome::Posted { .. }) {
                            break;
                        }
                        ring.release_chunk();
                    }
                }
            })
        };

        let mut cur = 0u32;
        let mut seen = 0u64;
        while seen < 10_000 {
            if let Some(v) = ring.poll(&mut cur) {
                assert_eq!(v, seen, "event order/body must match producer order");
                seen += 1;
                if seen % 8 == 0 {
                    ring.release_chunk();
                }
            }
        }
        producer.join().unwrap();
    }
}
