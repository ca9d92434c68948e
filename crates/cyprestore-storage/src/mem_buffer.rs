//! Pooled fixed-size I/O memory
//!
//! A [`MemBuffer`] recycles units of one size through a [`Ring`] and only
//! falls back to its [`Arena`] when the ring is empty. The number of units
//! ever created is capped at the ring capacity, so every outstanding unit
//! always has a slot to come back to.
//!
//! Units are handed out as [`MemUnit`] handles that keep the pool (and thus
//! the arena memory) alive and return themselves to the ring on drop.

#![allow(unsafe_code)]

use crate::arena::{Arena, ArenaConfig};
use crate::ring::{Ring, RingMode};
use cyprestore_common::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::error;

/// Address of one unit inside the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RawUnit(NonNull<u8>);

// The address is only dereferenced through the single MemUnit that owns it.
unsafe impl Send for RawUnit {}

/// Configuration for one pool
#[derive(Clone, Debug)]
pub struct MemBufferConfig {
    /// Label used in logs
    pub name: String,
    /// Size of every unit in bytes
    pub unit_size: usize,
    /// Ring size (power of two); bounds the number of units
    pub ring_size: u32,
    pub ring_mode: RingMode,
    pub arena: ArenaConfig,
}

/// Fixed-size unit pool: Ring for reuse, Arena for growth
pub struct MemBuffer {
    name: String,
    unit_size: usize,
    ring: Ring<RawUnit>,
    arena: Mutex<Arena>,
    created: AtomicU32,
}

impl MemBuffer {
    pub fn new(config: MemBufferConfig) -> Result<Arc<Self>> {
        if config.unit_size == 0 {
            return Err(Error::invalid_argument("mem buffer unit_size is zero"));
        }
        let ring = Ring::new(config.ring_size, config.ring_mode)?;
        let arena = Arena::new(config.arena)?;
        Ok(Arc::new(Self {
            name: config.name,
            unit_size: config.unit_size,
            ring,
            arena: Mutex::new(arena),
            created: AtomicU32::new(0),
        }))
    }

    /// Take a unit, reusing a returned one when available
    ///
    /// Fails with `RingFull` once the pool has created as many units as its
    /// ring can hold back, and propagates `OutOfMemory` from the arena.
    pub fn get(self: &Arc<Self>) -> Result<MemUnit> {
        if let Ok(raw) = self.ring.dequeue() {
            return Ok(self.wrap(raw));
        }

        let capacity = self.ring.capacity();
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| Error::RingFull)?;

        let mut addrs = Vec::with_capacity(1);
        if let Err(e) = self.arena.lock().allocate(self.unit_size, 1, &mut addrs) {
            self.created.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        let raw = addrs
            .pop()
            .map(RawUnit)
            .ok_or_else(|| Error::internal("arena returned no address"))?;
        Ok(self.wrap(raw))
    }

    /// Take `n` previously returned units without allocating
    ///
    /// Fails fast with `RingEmpty` unless all `n` are ready in the ring.
    pub fn get_burst(self: &Arc<Self>, n: u32) -> Result<Vec<MemUnit>> {
        let raws = self.ring.dequeue_bulk(n)?;
        Ok(raws.into_iter().map(|raw| self.wrap(raw)).collect())
    }

    /// Return a unit to the pool; equivalent to dropping it
    pub fn put(&self, unit: MemUnit) {
        debug_assert!(std::ptr::eq(Arc::as_ptr(&unit.owner), self));
        drop(unit);
    }

    fn wrap(self: &Arc<Self>, raw: RawUnit) -> MemUnit {
        MemUnit {
            raw,
            len: self.unit_size,
            owner: Arc::clone(self),
        }
    }

    fn recycle(&self, raw: RawUnit) {
        if self.ring.enqueue(raw).is_err() {
            // Cannot happen while `created <= capacity`; the unit is leaked
            // until the arena is released.
            error!(
                "MemBuffer {}: ring full on put, leaking unit {:p}",
                self.name,
                raw.0.as_ptr()
            );
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Most units this pool will ever create
    #[must_use]
    pub fn max_units(&self) -> u32 {
        self.ring.capacity()
    }

    /// Units created so far
    #[must_use]
    pub fn created(&self) -> u32 {
        self.created.load(Ordering::Acquire)
    }

    /// Units sitting in the ring ready for reuse (a snapshot)
    #[must_use]
    pub fn available(&self) -> u32 {
        self.ring.used()
    }

    /// Units currently held by callers (a snapshot)
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        self.created().saturating_sub(self.available())
    }
}

impl fmt::Debug for MemBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBuffer")
            .field("name", &self.name)
            .field("unit_size", &self.unit_size)
            .field("created", &self.created())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive handle to one pooled unit
pub struct MemUnit {
    raw: RawUnit,
    len: usize,
    owner: Arc<MemBuffer>,
}

impl MemUnit {
    /// Usable bytes in this unit
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the unit, stable for the unit's whole life
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.raw.0.as_ptr()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the unit spans `len` bytes inside an arena block that the
        // owning pool keeps alive, and this handle is its only user.
        unsafe { std::slice::from_raw_parts(self.raw.0.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, with exclusivity from `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.raw.0.as_ptr(), self.len) }
    }

    /// Copy `src` to the start of the unit and zero the rest
    pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.len {
            return Err(Error::invalid_argument(format!(
                "{} bytes do not fit in a {} byte unit",
                src.len(),
                self.len
            )));
        }
        let buf = self.as_mut_slice();
        buf[..src.len()].copy_from_slice(src);
        buf[src.len()..].fill(0);
        Ok(())
    }

    /// Pool this unit belongs to
    #[must_use]
    pub fn pool(&self) -> &Arc<MemBuffer> {
        &self.owner
    }
}

impl Drop for MemUnit {
    fn drop(&mut self) {
        self.owner.recycle(self.raw);
    }
}

impl fmt::Debug for MemUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemUnit")
            .field("addr", &self.raw.0.as_ptr())
            .field("len", &self.len)
            .field("pool", &self.owner.name)
            .finish()
    }
}

impl AsRef<[u8]> for MemUnit {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for MemUnit {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pool(ring_size: u32) -> Arc<MemBuffer> {
        MemBuffer::new(MemBufferConfig {
            name: "test".into(),
            unit_size: 4096,
            ring_size,
            ring_mode: RingMode::MpMc,
            arena: ArenaConfig {
                initial_block_size: 16 * 1024,
                max_block_size: 64 * 1024,
                ..ArenaConfig::default()
            },
        })
        .unwrap()
    }

    #[test]
    fn test_get_put_get_reuses_address() {
        let pool = pool(8);
        let unit = pool.get().unwrap();
        let addr = unit.as_ptr();
        pool.put(unit);

        let again = pool.get().unwrap();
        assert_eq!(again.as_ptr(), addr);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_get_bounded_by_ring_capacity() {
        let pool = pool(4);
        let units: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.outstanding(), 3);
        assert!(matches!(pool.get(), Err(Error::RingFull)));

        drop(units);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn test_get_burst_never_allocates() {
        let pool = pool(8);
        assert!(matches!(pool.get_burst(2), Err(Error::RingEmpty)));
        assert_eq!(pool.created(), 0);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        drop(a);
        assert!(matches!(pool.get_burst(2), Err(Error::RingEmpty)));
        drop(b);

        let burst = pool.get_burst(2).unwrap();
        assert_eq!(burst.len(), 2);
        assert_eq!(pool.created(), 2);
    }

    #[test]
    fn test_fill_from_zero_pads() {
        let pool = pool(4);
        let mut unit = pool.get().unwrap();
        unit.as_mut_slice().fill(0xff);
        unit.fill_from(b"abc").unwrap();
        assert_eq!(&unit.as_slice()[..3], b"abc");
        assert!(unit.as_slice()[3..].iter().all(|&b| b == 0));
        assert!(unit.fill_from(&vec![0u8; 4097]).is_err());
    }

    #[test]
    fn test_units_keep_pool_alive() {
        let pool = pool(4);
        let mut unit = pool.get().unwrap();
        drop(pool);
        unit.as_mut_slice()[0] = 7;
        assert_eq!(unit.as_slice()[0], 7);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = pool(64);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..1000u32 {
                        let mut unit = loop {
                            match pool.get() {
                                Ok(u) => break u,
                                Err(_) => thread::yield_now(),
                            }
                        };
                        unit.as_mut_slice()[0] = (i % 251) as u8;
                        assert_eq!(unit.as_slice()[0], (i % 251) as u8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.created() <= pool.max_units());
        assert_eq!(pool.outstanding(), 0);
    }
}
