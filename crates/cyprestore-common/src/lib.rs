//! CypreStore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! core types shared by the storage crate and the ExtentServer.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{check_crc32c, compute_crc32c};
pub use config::Config;
pub use error::{Error, Result, StatusCode};
pub use types::*;
