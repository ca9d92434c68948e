//! CypreStore storage engine building blocks
//!
//! This crate holds the node-local machinery the extent server is built on:
//! - Lock-free bounded rings (SP/MP x SC/MC)
//! - Arena-backed, pool-recycled I/O memory
//! - Bitmap space allocation over the raw device
//! - Durable extent -> unit mapping (redb)
//! - Pooled, reference-counted request contexts
//! - Block device backends (O_DIRECT / F_NOCACHE)

pub mod arena;
pub mod bdev;
pub mod bitmap;
pub mod extent_location;
pub mod io_mem;
pub mod kv;
pub mod mem_buffer;
pub mod raw_io;
pub mod request;
pub mod ring;

// Re-exports
pub use arena::{Arena, ArenaConfig};
pub use bdev::{BlockDevice, DeviceStats, FileBlockDevice, FileDeviceConfig};
pub use bitmap::{BitmapAllocator, SpaceAlloc};
pub use extent_location::{EXTENT_LOC_PREFIX, ExtentLocation, ExtentLocationMgr, location_key};
pub use io_mem::{IoMemConfig, IoMemMgr, MIN_UNIT_SIZE};
pub use kv::{KvError, KvStore, MemKvStore, RedbKvStore};
pub use mem_buffer::{MemBuffer, MemBufferConfig, MemUnit};
pub use raw_io::{ALIGNMENT, RawFile};
pub use request::{DoneCallback, IoReply, OpContext, Request, RequestInfo, RequestMgr};
pub use ring::{Ring, RingFull, RingMode};
