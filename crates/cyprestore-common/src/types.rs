//! Core type definitions for CypreStore
//!
//! Identifiers, physical allocation units, request kinds and the router
//! describing which ExtentServer instances own an extent.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// 1 KiB
pub const KIB: u64 = 1024;
/// 1 MiB
pub const MIB: u64 = 1024 * KIB;
/// 1 GiB
pub const GIB: u64 = 1024 * MIB;

/// Identifier of an ExtentServer instance in the cluster
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("es-{_0}")]
pub struct EsId(u32);

impl EsId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

/// An ExtentServer instance: identity plus the address peers reach it on
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EsInstance {
    pub id: EsId,
    pub address: String,
}

impl EsInstance {
    #[must_use]
    pub fn new(id: u32, address: impl Into<String>) -> Self {
        Self {
            id: EsId::new(id),
            address: address.into(),
        }
    }
}

/// Primary/secondary assignment for one extent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRouter {
    pub extent_id: String,
    pub primary: EsInstance,
    /// Ordered: replication fans out in this order
    pub secondaries: Vec<EsInstance>,
    pub version: u64,
}

impl ExtentRouter {
    /// Check if `es` is the primary for this extent
    #[must_use]
    pub fn is_primary(&self, es: EsId) -> bool {
        self.primary.id == es
    }

    /// Check if `es` is one of the secondaries for this extent
    #[must_use]
    pub fn is_secondary(&self, es: EsId) -> bool {
        self.secondaries.iter().any(|s| s.id == es)
    }
}

/// A contiguous physical allocation on the block device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AUnit {
    /// Byte offset on the device
    pub offset: u64,
    /// Length in bytes, a multiple of the allocator block size
    pub size: u64,
}

impl AUnit {
    #[must_use]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// End offset (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Kind of operation a pooled request carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RequestType {
    #[default]
    Noop,
    Read,
    Write,
    Replicate,
    Scrub,
    Delete,
    ReclaimExtent,
}

impl RequestType {
    /// Requests that carry a payload to be written
    #[must_use]
    pub const fn carries_payload(&self) -> bool {
        matches!(self, Self::Write | Self::Replicate)
    }

    /// Requests that act on the whole extent rather than a byte range
    #[must_use]
    pub const fn is_extent_op(&self) -> bool {
        matches!(self, Self::Delete | Self::ReclaimExtent)
    }
}

/// How writes enter the replica set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Writes land on the primary, which forwards to secondaries
    #[default]
    Standard,
    /// Writes may land on any replica; fan-out happens above the engine
    Star,
}

/// Block device backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Regular file or raw device accessed with positional I/O
    #[default]
    File,
    /// Userspace NVMe; reached through an external bdev implementation
    Nvme,
}
