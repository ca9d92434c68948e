//! CypreStore ExtentServer
//!
//! The storage engine of one node: request safety checks, replication
//! fan-out and local extent I/O on top of `cyprestore-storage`.

pub mod bare_engine;
pub mod replicate;
pub mod router;
pub mod server;
pub mod storage_engine;

pub use bare_engine::BareEngine;
pub use replicate::{NoPeers, PeerClient, PeerPool, ReplicateArgs, ReplicateCallback, ReplicateEngine};
pub use router::{RouterCache, RouterClient, RouterView, StandaloneRouter};
pub use server::{Collaborators, ExtentServer};
pub use storage_engine::{EngineConfig, EngineHandle, EngineStats, StorageEngine};
