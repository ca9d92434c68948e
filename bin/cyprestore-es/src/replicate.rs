//! Write fan-out to secondaries
//!
//! The primary forwards each write to every secondary in router order while
//! its own write proceeds. The request's reference count covers the local
//! write plus one slot per secondary; every secondary reports through
//! [`Request::complete_replica`], contacted or not.

use bytes::Bytes;
use cyprestore_common::{EsInstance, Error, Result};
use cyprestore_storage::Request;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Completion for one replicate call
pub type ReplicateCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// What a secondary receives for one write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicateArgs {
    pub extent_id: String,
    pub offset: u64,
    pub size: u64,
    pub payload: Bytes,
    pub crc32: Option<u32>,
}

/// Connection to one peer ExtentServer
pub trait PeerClient: Send + Sync {
    /// Send a replicate; `done` runs exactly once, on any thread
    fn replicate(&self, args: ReplicateArgs, done: ReplicateCallback);
}

/// Connection lookup by peer
pub trait PeerPool: Send + Sync {
    fn get_client(&self, peer: &EsInstance) -> Result<Arc<dyn PeerClient>>;
}

/// Peer pool for a node with no reachable peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

impl PeerPool for NoPeers {
    fn get_client(&self, peer: &EsInstance) -> Result<Arc<dyn PeerClient>> {
        Err(Error::ConnectionFailed(format!(
            "no connection to {} at {}",
            peer.id, peer.address
        )))
    }
}

/// Fan-out of writes to secondaries
pub struct ReplicateEngine {
    peers: Arc<dyn PeerPool>,
    sent: AtomicU64,
    skipped: AtomicU64,
}

impl ReplicateEngine {
    pub fn new(peers: Arc<dyn PeerPool>) -> Self {
        Self {
            peers,
            sent: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Forward `req` to every secondary on its router
    ///
    /// Sets the reference count to `1 + secondaries` before anything is
    /// sent. Once one connection lookup fails, that secondary and every
    /// later one are failed without being contacted. Returns
    /// [`Error::ReplicatePartialFail`] if any secondary was skipped; the
    /// caller goes on with the local write either way.
    pub fn send(&self, req: &Arc<Request>) -> Result<()> {
        let router = req
            .router()
            .ok_or_else(|| Error::internal(format!("request {} has no router", req.id())))?;
        let info = req.info()?;
        let total = router.secondaries.len();
        let count = u32::try_from(total + 1)
            .map_err(|_| Error::invalid_argument(format!("{total} secondaries")))?;
        req.set_ref_count(count);

        let args = ReplicateArgs {
            extent_id: info.extent_id,
            offset: info.offset,
            size: info.size,
            payload: info.payload,
            crc32: info.crc32,
        };

        let mut failed = 0;
        let mut link_down = false;
        for secondary in &router.secondaries {
            if !link_down {
                match self.peers.get_client(secondary) {
                    Ok(client) => {
                        let req = Arc::clone(req);
                        client.replicate(
                            args.clone(),
                            Box::new(move |outcome| req.complete_replica(outcome)),
                        );
                        self.sent.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            "Extent {}: no connection to secondary {}: {}",
                            args.extent_id, secondary.id, e
                        );
                        link_down = true;
                    }
                }
            }
            failed += 1;
            self.skipped.fetch_add(1, Ordering::Relaxed);
            req.complete_replica(Err(Error::ConnectionFailed(format!(
                "replicate to {} skipped",
                secondary.id
            ))));
        }

        if failed > 0 {
            return Err(Error::ReplicatePartialFail { failed, total });
        }
        debug!(
            "Extent {}: replicating {} bytes at {} to {} secondaries",
            args.extent_id, args.size, args.offset, total
        );
        Ok(())
    }

    /// Replicates handed to a peer client
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Secondaries failed without being contacted
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}
