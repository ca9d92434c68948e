//! Block-based bump allocator for I/O memory
//!
//! The arena hands out fixed-size units carved from large aligned blocks.
//! Nothing is freed individually: blocks are replaced when exhausted and
//! reclaimed all at once by [`Arena::release`] (or on drop). Blocks double in
//! size up to `max_block_size` and may be backed by huge pages.
//!
//! The arena itself is single-threaded (`&mut self`). Pools that share one
//! across threads wrap it in a mutex.

#![allow(unsafe_code)]

use cyprestore_common::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Default alignment, matching direct I/O requirements
pub const DEFAULT_ALIGN_SIZE: usize = 4096;

/// Huge page size used for `MAP_HUGETLB` mappings
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Arena configuration
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Size of the first block
    pub initial_block_size: usize,
    /// Blocks never grow past this size
    pub max_block_size: usize,
    /// Alignment of every block (power of two)
    pub align_size: usize,
    /// Try to back blocks with huge pages
    pub huge_page: bool,
    /// Upper bound on bytes reserved across all blocks
    pub memory_limit: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_block_size: 1024 * 1024,
            max_block_size: 64 * 1024 * 1024,
            align_size: DEFAULT_ALIGN_SIZE,
            huge_page: false,
            memory_limit: None,
        }
    }
}

/// Where a block's memory came from, so it is returned the same way
#[derive(Debug)]
enum Backing {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    HugePage,
}

/// One contiguous allocation the arena bumps through
#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    capacity: usize,
    size: usize,
    backing: Backing,
    next: Option<Box<Block>>,
}

impl Block {
    fn remaining(&self) -> usize {
        self.capacity - self.size
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: ptr was returned by alloc with this exact layout.
            Backing::Heap(layout) => unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) },
            #[cfg(target_os = "linux")]
            Backing::HugePage => {
                // SAFETY: ptr/capacity describe a mapping created by mmap.
                let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.capacity) };
                if ret != 0 {
                    warn!(
                        "munmap of huge page block failed: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
        }
        // Unlink iteratively so a long chain does not recurse on drop.
        let mut next = self.next.take();
        while let Some(mut block) = next {
            next = block.next.take();
        }
    }
}

/// Bump allocator over a list of aligned blocks
#[derive(Debug)]
pub struct Arena {
    config: ArenaConfig,
    head: Option<Box<Block>>,
    reserved_bytes: usize,
    allocated_bytes: usize,
    block_count: usize,
}

// Blocks are plain memory owned exclusively by the arena.
unsafe impl Send for Arena {}

impl Arena {
    /// Create an empty arena; no memory is reserved until the first allocation
    pub fn new(config: ArenaConfig) -> Result<Self> {
        if !config.align_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "arena align_size {} is not a power of two",
                config.align_size
            )));
        }
        if config.initial_block_size == 0 || config.max_block_size < config.initial_block_size {
            return Err(Error::invalid_argument(format!(
                "arena block sizes invalid: initial {}, max {}",
                config.initial_block_size, config.max_block_size
            )));
        }
        Ok(Self {
            config,
            head: None,
            reserved_bytes: 0,
            allocated_bytes: 0,
            block_count: 0,
        })
    }

    /// Allocate `count` units of `unit_size` bytes, appending their addresses to `out`
    ///
    /// All or nothing: on failure `out` is left exactly as it was.
    pub fn allocate(
        &mut self,
        unit_size: usize,
        count: usize,
        out: &mut Vec<NonNull<u8>>,
    ) -> Result<()> {
        if unit_size == 0 || count == 0 {
            return Err(Error::invalid_argument(format!(
                "arena allocation of {count} x {unit_size} bytes"
            )));
        }
        let unit = align_up(unit_size, self.config.align_size);
        let requested = unit
            .checked_mul(count)
            .ok_or_else(|| Error::OutOfMemory(format!("{count} x {unit} bytes overflows")))?;

        let fits = self.head.as_ref().is_some_and(|b| b.remaining() >= requested);
        if !fits {
            self.grow(requested)?;
        }

        let block = self
            .head
            .as_mut()
            .ok_or_else(|| Error::internal("arena has no block after growing"))?;
        out.reserve(count);
        for i in 0..count {
            let offset = block.size + i * unit;
            // SAFETY: offset + unit <= capacity, checked through `remaining`.
            let addr = unsafe { block.ptr.as_ptr().add(offset) };
            // SAFETY: derived from a non-null block pointer.
            out.push(unsafe { NonNull::new_unchecked(addr) });
        }
        block.size += requested;
        self.allocated_bytes += requested;
        Ok(())
    }

    /// Free every block and return to the empty state
    pub fn release(&mut self) {
        self.head = None;
        if self.block_count > 0 {
            debug!(
                "Released arena: {} blocks, {} bytes",
                self.block_count, self.reserved_bytes
            );
        }
        self.reserved_bytes = 0;
        self.allocated_bytes = 0;
        self.block_count = 0;
    }

    /// Bytes handed out to callers
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Bytes reserved from the system across all blocks
    #[must_use]
    pub const fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    #[must_use]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    fn grow(&mut self, requested: usize) -> Result<()> {
        let current = self
            .head
            .as_ref()
            .map_or(self.config.initial_block_size / 2, |b| b.capacity);
        let size = current
            .saturating_mul(2)
            .max(requested)
            .min(self.config.max_block_size);
        let size = align_up(size, self.config.align_size);
        if size < requested {
            return Err(Error::OutOfMemory(format!(
                "request of {requested} bytes exceeds max block size {}",
                self.config.max_block_size
            )));
        }
        if let Some(limit) = self.config.memory_limit
            && self.reserved_bytes + size > limit
        {
            return Err(Error::OutOfMemory(format!(
                "arena limit {limit} bytes reached ({} reserved, {size} more needed)",
                self.reserved_bytes
            )));
        }

        let (ptr, capacity, backing) = self.allocate_block(size)?;
        let block = Box::new(Block {
            ptr,
            capacity,
            size: 0,
            backing,
            next: self.head.take(),
        });
        self.head = Some(block);
        self.reserved_bytes += capacity;
        self.block_count += 1;
        Ok(())
    }

    fn allocate_block(&self, size: usize) -> Result<(NonNull<u8>, usize, Backing)> {
        #[cfg(target_os = "linux")]
        {
            if self.config.huge_page {
                if let Some(ptr) = map_huge_pages(size) {
                    return Ok((ptr, align_up(size, HUGE_PAGE_SIZE), Backing::HugePage));
                }
                debug!("Huge pages unavailable, falling back to heap for {size} byte block");
            }
        }

        let layout = Layout::from_size_align(size, self.config.align_size)
            .map_err(|e| Error::OutOfMemory(format!("invalid block layout: {e}")))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::OutOfMemory(format!("failed to allocate {size} byte block")))?;
        Ok((ptr, size, Backing::Heap(layout)))
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(target_os = "linux")]
fn map_huge_pages(size: usize) -> Option<NonNull<u8>> {
    let len = align_up(size, HUGE_PAGE_SIZE);
    // SAFETY: anonymous private mapping; no file descriptor involved.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast())
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ArenaConfig {
        ArenaConfig {
            initial_block_size: 16 * 1024,
            max_block_size: 64 * 1024,
            align_size: 4096,
            huge_page: false,
            memory_limit: None,
        }
    }

    #[test]
    fn test_arena_bump_allocation() {
        let mut arena = Arena::new(small_config()).unwrap();
        let mut out = Vec::new();
        arena.allocate(4096, 3, &mut out).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(arena.block_count(), 1);
        for pair in out.windows(2) {
            let delta = pair[1].as_ptr() as usize - pair[0].as_ptr() as usize;
            assert_eq!(delta, 4096);
        }
        for addr in &out {
            assert_eq!(addr.as_ptr() as usize % 4096, 0);
        }
        assert_eq!(arena.allocated_bytes(), 3 * 4096);
    }

    #[test]
    fn test_arena_blocks_double_until_max() {
        let mut arena = Arena::new(small_config()).unwrap();
        let mut out = Vec::new();

        arena.allocate(16 * 1024, 1, &mut out).unwrap();
        assert_eq!(arena.reserved_bytes(), 16 * 1024);

        arena.allocate(4096, 1, &mut out).unwrap();
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.reserved_bytes(), 16 * 1024 + 32 * 1024);

        arena.allocate(32 * 1024, 1, &mut out).unwrap();
        arena.allocate(64 * 1024, 1, &mut out).unwrap();
        assert_eq!(arena.block_count(), 4);
    }

    #[test]
    fn test_arena_all_or_nothing() {
        let mut config = small_config();
        config.memory_limit = Some(16 * 1024);
        let mut arena = Arena::new(config).unwrap();

        let mut out = Vec::new();
        arena.allocate(4096, 4, &mut out).unwrap();
        assert_eq!(out.len(), 4);

        let mut more = Vec::new();
        let err = arena.allocate(4096, 2, &mut more).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert!(more.is_empty());
        assert_eq!(arena.allocated_bytes(), 4 * 4096);
    }

    #[test]
    fn test_arena_request_larger_than_max_block() {
        let mut arena = Arena::new(small_config()).unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            arena.allocate(4096, 17, &mut out),
            Err(Error::OutOfMemory(_))
        ));
        assert!(out.is_empty());
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    fn test_arena_release() {
        let mut arena = Arena::new(small_config()).unwrap();
        let mut out = Vec::new();
        arena.allocate(8192, 4, &mut out).unwrap();
        arena.allocate(8192, 4, &mut out).unwrap();
        assert!(arena.block_count() >= 1);

        arena.release();
        assert_eq!(arena.block_count(), 0);
        assert_eq!(arena.reserved_bytes(), 0);
        assert_eq!(arena.allocated_bytes(), 0);

        out.clear();
        arena.allocate(4096, 1, &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_arena_memory_is_writable() {
        let mut arena = Arena::new(small_config()).unwrap();
        let mut out = Vec::new();
        arena.allocate(4096, 2, &mut out).unwrap();
        // SAFETY: each unit is 4096 bytes owned by this test.
        unsafe {
            std::ptr::write_bytes(out[0].as_ptr(), 0xab, 4096);
            std::ptr::write_bytes(out[1].as_ptr(), 0xcd, 4096);
            assert_eq!(*out[0].as_ptr().add(4095), 0xab);
            assert_eq!(*out[1].as_ptr(), 0xcd);
        }
    }

    #[test]
    fn test_arena_rejects_bad_config() {
        let mut config = small_config();
        config.align_size = 3000;
        assert!(Arena::new(config).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
