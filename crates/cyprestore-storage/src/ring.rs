//! Lock-free fixed-capacity ring
//!
//! A bounded FIFO in the DPDK `rte_ring` style. Producers and consumers each
//! own a head/tail pair of 32-bit counters that grow monotonically and wrap
//! through unsigned overflow; slots are addressed with `counter & mask`.
//!
//! Moving an element is two steps: the head is advanced to reserve slots
//! (a plain store for single-producer/consumer, a CAS loop otherwise), then
//! the tail is advanced to publish them. With several producers a producer
//! waits until every earlier reservation has been published before moving
//! the tail, so consumers observe slots in reservation order.

#![allow(unsafe_code)]

use crossbeam_utils::{Backoff, CachePadded};
use cyprestore_common::{Error, Result};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// Largest supported ring size; keeps `prod - cons` unambiguous under wrap
pub const MAX_RING_SIZE: u32 = 1 << 31;

/// Producer/consumer concurrency of a ring
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RingMode {
    /// Single producer, single consumer
    SpSc,
    /// Multi producer, single consumer
    MpSc,
    /// Single producer, multi consumer
    SpMc,
    /// Multi producer, multi consumer
    #[default]
    MpMc,
}

impl RingMode {
    const fn multi_producer(self) -> bool {
        matches!(self, Self::MpSc | Self::MpMc)
    }

    const fn multi_consumer(self) -> bool {
        matches!(self, Self::SpMc | Self::MpMc)
    }
}

/// Returned by [`Ring::enqueue`] when no slot is free; hands the value back
pub struct RingFull<T>(pub T);

impl<T> RingFull<T> {
    /// Recover the rejected value
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RingFull(..)")
    }
}

impl<T> From<RingFull<T>> for Error {
    fn from(_: RingFull<T>) -> Self {
        Error::RingFull
    }
}

#[derive(Default)]
struct HeadTail {
    head: AtomicU32,
    tail: AtomicU32,
}

/// Bounded lock-free FIFO of owned values
pub struct Ring<T> {
    mode: RingMode,
    size: u32,
    mask: u32,
    capacity: u32,
    prod: CachePadded<HeadTail>,
    cons: CachePadded<HeadTail>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Slots are only touched between a successful head reservation and the
// matching tail publish, which hands exclusive access to one thread.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring with `size` slots (`size - 1` usable)
    ///
    /// `size` must be a power of two between 2 and [`MAX_RING_SIZE`].
    pub fn new(size: u32, mode: RingMode) -> Result<Self> {
        if size < 2 || !size.is_power_of_two() || size > MAX_RING_SIZE {
            return Err(Error::invalid_argument(format!(
                "ring size {size} is not a power of two in [2, 2^31]"
            )));
        }

        let slots = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            mode,
            size,
            mask: size - 1,
            capacity: size - 1,
            prod: CachePadded::new(HeadTail::default()),
            cons: CachePadded::new(HeadTail::default()),
            slots,
        })
    }

    /// Number of slots, including the reserved one
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Maximum number of elements the ring holds
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn mode(&self) -> RingMode {
        self.mode
    }

    /// Elements currently queued (a snapshot; may be stale under concurrency)
    #[must_use]
    pub fn used(&self) -> u32 {
        let prod_tail = self.prod.tail.load(Ordering::Acquire);
        let cons_tail = self.cons.tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(self.capacity)
    }

    /// Free slots (a snapshot; may be stale under concurrency)
    #[must_use]
    pub fn free(&self) -> u32 {
        self.capacity - self.used()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.used() == self.capacity
    }

    /// Push one value, or hand it back if the ring is full
    pub fn enqueue(&self, obj: T) -> std::result::Result<(), RingFull<T>> {
        let Some(head) = self.reserve_prod(1) else {
            return Err(RingFull(obj));
        };
        // SAFETY: slot `head` was reserved above and is not visible to
        // consumers until `publish_prod` moves the tail past it.
        unsafe { (*self.slot(head)).write(obj) };
        self.publish_prod(head, 1);
        Ok(())
    }

    /// Pop the oldest value
    pub fn dequeue(&self) -> Result<T> {
        let head = self.reserve_cons(1, true).ok_or(Error::RingEmpty)?.0;
        // SAFETY: slot `head` was published by a producer and reserved for
        // this consumer; producers cannot reuse it until `publish_cons`.
        let obj = unsafe { (*self.slot(head)).assume_init_read() };
        self.publish_cons(head, 1);
        Ok(obj)
    }

    /// Pop exactly `n` values, or none at all
    pub fn dequeue_bulk(&self, n: u32) -> Result<Vec<T>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let (head, taken) = self.reserve_cons(n, true).ok_or(Error::RingEmpty)?;
        Ok(self.take_reserved(head, taken))
    }

    /// Pop up to `max` values; returns an empty vector when nothing is queued
    pub fn dequeue_burst(&self, max: u32) -> Vec<T> {
        if max == 0 {
            return Vec::new();
        }
        match self.reserve_cons(max, false) {
            Some((head, taken)) => self.take_reserved(head, taken),
            None => Vec::new(),
        }
    }

    fn take_reserved(&self, head: u32, n: u32) -> Vec<T> {
        let mut out = Vec::with_capacity(n as usize);
        for i in 0..n {
            let idx = head.wrapping_add(i);
            // SAFETY: see `dequeue`; the whole range was reserved at once.
            out.push(unsafe { (*self.slot(idx)).assume_init_read() });
        }
        self.publish_cons(head, n);
        out
    }

    fn slot(&self, counter: u32) -> *mut MaybeUninit<T> {
        self.slots[(counter & self.mask) as usize].get()
    }

    /// Advance the producer head by `n`; `None` when fewer than `n` slots are free
    fn reserve_prod(&self, n: u32) -> Option<u32> {
        loop {
            let head = self.prod.head.load(Ordering::Relaxed);
            let cons_tail = self.cons.tail.load(Ordering::Acquire);
            // capacity + cons_tail - prod_head, in wrapping arithmetic
            let free = self.capacity.wrapping_add(cons_tail).wrapping_sub(head);
            if free < n {
                return None;
            }
            let next = head.wrapping_add(n);

            if !self.mode.multi_producer() {
                self.prod.head.store(next, Ordering::Relaxed);
                return Some(head);
            }
            if self
                .prod
                .head
                .compare_exchange_weak(head, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    fn publish_prod(&self, head: u32, n: u32) {
        if self.mode.multi_producer() {
            let backoff = Backoff::new();
            // Acquire chains the earlier publisher's slot writes into ours.
            while self.prod.tail.load(Ordering::Acquire) != head {
                backoff.snooze();
            }
        }
        self.prod.tail.store(head.wrapping_add(n), Ordering::Release);
    }

    /// Advance the consumer head; with `exact` all `n` or nothing, otherwise up to `n`
    fn reserve_cons(&self, n: u32, exact: bool) -> Option<(u32, u32)> {
        loop {
            let head = self.cons.head.load(Ordering::Relaxed);
            let prod_tail = self.prod.tail.load(Ordering::Acquire);
            let entries = prod_tail.wrapping_sub(head);
            let take = if exact {
                if entries < n {
                    return None;
                }
                n
            } else {
                entries.min(n)
            };
            if take == 0 {
                return None;
            }
            let next = head.wrapping_add(take);

            if !self.mode.multi_consumer() {
                self.cons.head.store(next, Ordering::Relaxed);
                return Some((head, take));
            }
            if self
                .cons
                .head
                .compare_exchange_weak(head, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some((head, take));
            }
        }
    }

    fn publish_cons(&self, head: u32, n: u32) {
        if self.mode.multi_consumer() {
            let backoff = Backoff::new();
            // Acquire chains the earlier publisher's slot writes into ours.
            while self.cons.tail.load(Ordering::Acquire) != head {
                backoff.snooze();
            }
        }
        self.cons.tail.store(head.wrapping_add(n), Ordering::Release);
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut cons = *self.cons.tail.get_mut();
        let prod = *self.prod.tail.get_mut();
        while cons != prod {
            // SAFETY: every slot in [cons_tail, prod_tail) holds a value that
            // was published and never consumed.
            unsafe { (*self.slot(cons)).assume_init_drop() };
            cons = cons.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("mode", &self.mode)
            .field("size", &self.size)
            .field("used", &self.used())
            .finish()
    }
}
