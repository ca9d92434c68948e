//! Error types for CypreStore
//!
//! Every internal operation returns [`Result`]. Expected conditions (pool
//! exhaustion, missing extents, stale routing) are variants here; only
//! programmer errors are asserted.

use thiserror::Error;

/// Common result type for CypreStore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for CypreStore
#[derive(Debug, Error)]
pub enum Error {
    // Argument errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Pool errors
    #[error("ring is full")]
    RingFull,

    #[error("ring is empty")]
    RingEmpty,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    // Space errors
    #[error("no space left on disk: requested {requested} bytes")]
    DiskNoSpace { requested: u64 },

    #[error("disk is empty")]
    DiskEmpty,

    #[error("extent is empty: {0}")]
    ExtentEmpty(String),

    // Engine errors
    #[error("query router failed for extent {extent_id}: {reason}")]
    QueryRouterFail { extent_id: String, reason: String },

    #[error("no permission: {0}")]
    NoPermission(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumError { expected: u32, actual: u32 },

    #[error("replication partially failed: {failed} of {total} secondaries")]
    ReplicatePartialFail { failed: usize, total: usize },

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("kv store error: {0}")]
    Kv(String),

    // Network errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Status codes carried by every RPC response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    InvalidArgument = 1,
    RingFull = 2,
    RingEmpty = 3,
    OutOfMemory = 4,
    DiskNoSpace = 5,
    DiskEmpty = 6,
    ExtentEmpty = 7,
    QueryRouterFail = 8,
    NoPermission = 9,
    ChecksumError = 10,
    ReplicatePartialFail = 11,
    IoError = 12,
    NotImplemented = 13,
    InternalError = 14,
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Check if the caller may retry the operation
    ///
    /// Pool exhaustion and routing failures clear up on their own (or after a
    /// router refresh); space and checksum failures do not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RingFull
                | Self::RingEmpty
                | Self::QueryRouterFail { .. }
                | Self::NoPermission(_)
                | Self::ConnectionFailed(_)
        )
    }

    /// Status code reported to the client for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::Configuration(_) => StatusCode::InvalidArgument,
            Self::RingFull => StatusCode::RingFull,
            Self::RingEmpty => StatusCode::RingEmpty,
            Self::OutOfMemory(_) => StatusCode::OutOfMemory,
            Self::DiskNoSpace { .. } => StatusCode::DiskNoSpace,
            Self::DiskEmpty => StatusCode::DiskEmpty,
            Self::ExtentEmpty(_) => StatusCode::ExtentEmpty,
            Self::QueryRouterFail { .. } => StatusCode::QueryRouterFail,
            Self::NoPermission(_) => StatusCode::NoPermission,
            Self::ChecksumError { .. } => StatusCode::ChecksumError,
            Self::ReplicatePartialFail { .. } => StatusCode::ReplicatePartialFail,
            Self::DiskIo(_) | Self::Storage(_) | Self::Kv(_) => StatusCode::IoError,
            Self::NotImplemented(_) => StatusCode::NotImplemented,
            Self::ConnectionFailed(_) | Self::Internal(_) | Self::Serialization(_) => {
                StatusCode::InternalError
            }
        }
    }
}
