//! I/O memory manager
//!
//! One [`MemBuffer`] per power-of-two size class: class `n` hands out units
//! of `4 KiB << n`. A request for `size` bytes is served by the smallest class
//! whose units fit it.

use crate::arena::ArenaConfig;
use crate::mem_buffer::{MemBuffer, MemBufferConfig, MemUnit};
use crate::ring::RingMode;
use cyprestore_common::config::PoolConfig;
use cyprestore_common::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Unit size of the smallest class
pub const MIN_UNIT_SIZE: usize = 4096;

/// Size-class configuration
#[derive(Clone, Debug)]
pub struct IoMemConfig {
    /// Number of classes; the largest serves `4 KiB << (classes - 1)`
    pub classes: u32,
    /// Ring size for every class (power of two)
    pub ring_size: u32,
    pub initial_block_size: usize,
    pub max_block_size: usize,
    pub huge_page: bool,
}

impl Default for IoMemConfig {
    fn default() -> Self {
        Self {
            classes: 9,
            ring_size: 1024,
            initial_block_size: 2 * 1024 * 1024,
            max_block_size: 64 * 1024 * 1024,
            huge_page: false,
        }
    }
}

impl From<&PoolConfig> for IoMemConfig {
    fn from(pools: &PoolConfig) -> Self {
        Self {
            classes: pools.mem_classes,
            ring_size: pools.mem_ring_size,
            initial_block_size: pools.arena_initial_block,
            max_block_size: pools.arena_max_block,
            huge_page: pools.huge_page,
        }
    }
}

/// Routes I/O buffer requests to per-size-class pools
#[derive(Debug)]
pub struct IoMemMgr {
    classes: Vec<Arc<MemBuffer>>,
}

impl IoMemMgr {
    pub fn new(config: &IoMemConfig) -> Result<Self> {
        if config.classes == 0 || config.classes > 16 {
            return Err(Error::invalid_argument(format!(
                "io mem classes {} not in [1, 16]",
                config.classes
            )));
        }

        let mut classes = Vec::with_capacity(config.classes as usize);
        for n in 0..config.classes {
            let unit_size = MIN_UNIT_SIZE << n;
            // A block must hold at least one unit of the class.
            let max_block = config.max_block_size.max(unit_size);
            let initial_block = config.initial_block_size.clamp(unit_size, max_block);
            classes.push(MemBuffer::new(MemBufferConfig {
                name: format!("io-{}k", unit_size / 1024),
                unit_size,
                ring_size: config.ring_size,
                ring_mode: RingMode::MpMc,
                arena: ArenaConfig {
                    initial_block_size: initial_block,
                    max_block_size: max_block,
                    huge_page: config.huge_page,
                    ..ArenaConfig::default()
                },
            })?);
        }

        info!(
            "IoMemMgr initialized: {} classes, {} .. {} bytes, ring size {}",
            classes.len(),
            MIN_UNIT_SIZE,
            MIN_UNIT_SIZE << (config.classes - 1),
            config.ring_size
        );
        Ok(Self { classes })
    }

    /// Index of the smallest class holding `size` bytes
    pub fn class_for(&self, size: usize) -> Result<usize> {
        let units = size.max(1).div_ceil(MIN_UNIT_SIZE);
        let class = units.next_power_of_two().trailing_zeros() as usize;
        if class >= self.classes.len() {
            return Err(Error::invalid_argument(format!(
                "I/O size {size} exceeds largest memory class {}",
                self.max_unit_size()
            )));
        }
        Ok(class)
    }

    /// Get a unit of at least `size` bytes
    pub fn get(&self, size: usize) -> Result<MemUnit> {
        let class = self.class_for(size)?;
        self.classes[class].get()
    }

    /// Get `n` ready units of at least `size` bytes without allocating
    pub fn get_burst(&self, size: usize, n: u32) -> Result<Vec<MemUnit>> {
        let class = self.class_for(size)?;
        self.classes[class].get_burst(n)
    }

    /// Return a unit; equivalent to dropping it
    pub fn put(&self, unit: MemUnit) {
        drop(unit);
    }

    #[must_use]
    pub fn max_unit_size(&self) -> usize {
        MIN_UNIT_SIZE << (self.classes.len() - 1)
    }

    #[must_use]
    pub fn classes(&self) -> &[Arc<MemBuffer>] {
        &self.classes
    }
}
