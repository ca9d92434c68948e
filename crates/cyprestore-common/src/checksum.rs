//! Checksum utilities for CypreStore
//!
//! Payload integrity uses CRC32C end to end: clients attach it to writes,
//! the engine recomputes it before touching the device, and scrubs return
//! it for cross-replica comparison.

use crate::error::{Error, Result};

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Verify `data` against `expected`, reporting both values on mismatch
pub fn check_crc32c(data: &[u8], expected: u32) -> Result<()> {
    let actual = compute_crc32c(data);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::ChecksumError { expected, actual })
    }
}
