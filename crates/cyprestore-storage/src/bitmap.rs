//! Bitmap-based physical space allocation
//!
//! The device is split into fixed-size blocks (1 MiB by default), tracked
//! one bit per block: 0 = free, 1 = used. Bits are grouped into chunks of at
//! most [`MAX_BLOCKS_PER_CHUNK`] blocks, each behind its own mutex, so
//! concurrent allocations mostly touch different chunks.
//!
//! An allocation never spans chunks. It starts at a random chunk and walks
//! forward once around the array; inside a chunk the scan resumes from the
//! chunk's `last_free_bit` frontier.

use cyprestore_common::{AUnit, Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Upper bound on blocks tracked by one chunk
pub const MAX_BLOCKS_PER_CHUNK: u64 = 1 << 20;

/// Physical space allocator the extent layer depends on
pub trait SpaceAlloc: Send + Sync {
    /// Allocate at least `want_size` contiguous bytes
    fn allocate(&self, want_size: u64) -> Result<AUnit>;

    /// Release a previously allocated unit
    fn free(&self, aunit: &AUnit) -> Result<()>;

    /// Record a unit as used without searching (recovery replay)
    fn mark(&self, aunit: &AUnit) -> Result<()>;

    /// Free bytes remaining
    fn free_size(&self) -> u64;

    /// Total bytes managed
    fn capacity(&self) -> u64;
}

/// Bitmap over one chunk's worth of blocks
#[derive(Debug)]
struct Chunk {
    words: Vec<u64>,
    num_blocks: u64,
    num_free_blocks: u64,
    /// Scan frontier; moved back when a hole opens before it
    last_free_bit: u64,
}

impl Chunk {
    fn new(num_blocks: u64) -> Self {
        Self {
            words: vec![0u64; num_blocks.div_ceil(64) as usize],
            num_blocks,
            num_free_blocks: num_blocks,
            last_free_bit: 0,
        }
    }

    fn is_set(&self, bit: u64) -> bool {
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: u64) {
        self.words[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: u64) {
        self.words[(bit / 64) as usize] &= !(1 << (bit % 64));
    }

    /// Find `count` clear bits in a row within `[start, end)`
    fn find_run(&self, start: u64, end: u64, count: u64) -> Option<u64> {
        let mut run_start = start;
        let mut run_len = 0u64;
        let mut bit = start;

        while bit < end {
            // Skip fully used words quickly.
            if bit % 64 == 0 && bit + 64 <= end && self.words[(bit / 64) as usize] == u64::MAX {
                bit += 64;
                run_start = bit;
                run_len = 0;
                continue;
            }
            if self.is_set(bit) {
                run_start = bit + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            bit += 1;
        }
        None
    }

    /// Allocate `count` consecutive blocks, returning the first bit
    fn allocate(&mut self, count: u64) -> Option<u64> {
        if count > self.num_free_blocks {
            return None;
        }
        let frontier = self.last_free_bit.min(self.num_blocks);
        let start = self
            .find_run(frontier, self.num_blocks, count)
            .or_else(|| {
                // Wrap once: a run may end just past the old frontier.
                let end = (frontier + count - 1).min(self.num_blocks);
                (frontier > 0).then(|| self.find_run(0, end, count)).flatten()
            })?;

        for bit in start..start + count {
            self.set(bit);
        }
        self.num_free_blocks -= count;
        self.last_free_bit = start + count;
        Some(start)
    }

    /// Clear `[start, start + count)`; returns how many bits were actually set
    fn free(&mut self, start: u64, count: u64) -> u64 {
        let mut cleared = 0;
        for bit in start..start + count {
            debug_assert!(self.is_set(bit), "double free of block bit {bit}");
            if self.is_set(bit) {
                self.clear(bit);
                cleared += 1;
            }
        }
        self.num_free_blocks += cleared;
        if start < self.last_free_bit {
            self.last_free_bit = start;
        }
        cleared
    }

    /// Set `[start, start + count)`; returns how many bits were newly set
    fn mark(&mut self, start: u64, count: u64) -> u64 {
        let mut marked = 0;
        for bit in start..start + count {
            if !self.is_set(bit) {
                self.set(bit);
                marked += 1;
            }
        }
        self.num_free_blocks -= marked;
        marked
    }
}

/// Chunked bitmap allocator covering a whole device
#[derive(Debug)]
pub struct BitmapAllocator {
    block_size: u64,
    blocks_per_chunk: u64,
    total_blocks: u64,
    free_blocks: AtomicU64,
    chunks: Vec<Mutex<Chunk>>,
}

impl BitmapAllocator {
    /// Create an allocator for `capacity` bytes, all free
    ///
    /// A trailing partial block is not managed.
    pub fn new(capacity: u64, block_size: u64, blocks_per_chunk: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::invalid_argument("bitmap block size is zero"));
        }
        if blocks_per_chunk == 0 || blocks_per_chunk > MAX_BLOCKS_PER_CHUNK {
            return Err(Error::invalid_argument(format!(
                "blocks per chunk {blocks_per_chunk} not in [1, {MAX_BLOCKS_PER_CHUNK}]"
            )));
        }
        let total_blocks = capacity / block_size;
        if total_blocks == 0 {
            return Err(Error::invalid_argument(format!(
                "capacity {capacity} is smaller than one block of {block_size}"
            )));
        }

        let chunks = (0..total_blocks.div_ceil(blocks_per_chunk))
            .map(|i| {
                let first = i * blocks_per_chunk;
                Mutex::new(Chunk::new((total_blocks - first).min(blocks_per_chunk)))
            })
            .collect::<Vec<_>>();

        info!(
            "BitmapAllocator: {} blocks of {} bytes in {} chunks",
            total_blocks,
            block_size,
            chunks.len()
        );
        Ok(Self {
            block_size,
            blocks_per_chunk,
            total_blocks,
            free_blocks: AtomicU64::new(total_blocks),
            chunks,
        })
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub const fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Check if the block holding byte `offset` is in use
    #[must_use]
    pub fn is_allocated(&self, offset: u64) -> bool {
        let block = offset / self.block_size;
        if block >= self.total_blocks {
            return true;
        }
        let chunk = self.chunks[(block / self.blocks_per_chunk) as usize].lock();
        chunk.is_set(block % self.blocks_per_chunk)
    }

    fn blocks_for(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size)
    }

    /// Translate a unit into (chunk index, first bit, bit count)
    fn locate(&self, aunit: &AUnit) -> Result<(usize, u64, u64)> {
        if aunit.offset % self.block_size != 0 || aunit.size == 0 {
            return Err(Error::invalid_argument(format!(
                "unit {}+{} is not block aligned ({})",
                aunit.offset, aunit.size, self.block_size
            )));
        }
        let first_block = aunit.offset / self.block_size;
        let count = self.blocks_for(aunit.size);
        if first_block + count > self.total_blocks {
            return Err(Error::invalid_argument(format!(
                "unit {}+{} beyond device end",
                aunit.offset, aunit.size
            )));
        }
        let chunk_idx = first_block / self.blocks_per_chunk;
        let bit = first_block % self.blocks_per_chunk;
        if bit + count > self.blocks_per_chunk {
            return Err(Error::invalid_argument(format!(
                "unit {}+{} spans chunks",
                aunit.offset, aunit.size
            )));
        }
        Ok((chunk_idx as usize, bit, count))
    }
}

impl SpaceAlloc for BitmapAllocator {
    fn allocate(&self, want_size: u64) -> Result<AUnit> {
        let count = self.blocks_for(want_size);
        if count == 0 {
            return Err(Error::invalid_argument("allocation of zero blocks"));
        }

        let num_chunks = self.chunks.len();
        let start = rand::thread_rng().gen_range(0..num_chunks);
        for i in 0..num_chunks {
            let idx = (start + i) % num_chunks;
            let bit = self.chunks[idx].lock().allocate(count);
            if let Some(bit) = bit {
                self.free_blocks.fetch_sub(count, Ordering::Relaxed);
                let block = idx as u64 * self.blocks_per_chunk + bit;
                return Ok(AUnit::new(block * self.block_size, count * self.block_size));
            }
        }

        debug!(
            "No chunk has {} free blocks in a row ({} free overall)",
            count,
            self.free_blocks()
        );
        Err(Error::DiskNoSpace {
            requested: want_size,
        })
    }

    fn free(&self, aunit: &AUnit) -> Result<()> {
        let (idx, bit, count) = self.locate(aunit)?;
        let cleared = self.chunks[idx].lock().free(bit, count);
        self.free_blocks.fetch_add(cleared, Ordering::Relaxed);
        Ok(())
    }

    fn mark(&self, aunit: &AUnit) -> Result<()> {
        let (idx, bit, count) = self.locate(aunit)?;
        let marked = self.chunks[idx].lock().mark(bit, count);
        self.free_blocks.fetch_sub(marked, Ordering::Relaxed);
        Ok(())
    }

    fn free_size(&self) -> u64 {
        self.free_blocks() * self.block_size
    }

    fn capacity(&self) -> u64 {
        self.total_blocks * self.block_size
    }
}
