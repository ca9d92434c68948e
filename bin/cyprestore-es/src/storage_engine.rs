//! Storage engine: the safety pipeline in front of local I/O
//!
//! Every request runs, in order:
//!
//! 1. router lookup (not for Delete / ReclaimExtent)
//! 2. parameter checks (alignment, extent bounds, payload length)
//! 3. ownership checks against the router
//! 4. payload checksum (Write / Replicate carrying a CRC32C)
//!
//! Only then is a Write fanned out to secondaries (standard replication)
//! and the request handed to the [`BareEngine`]. A failed check completes
//! the request with that error; nothing reaches the device.

use crate::bare_engine::BareEngine;
use crate::replicate::ReplicateEngine;
use crate::router::{RouterCache, RouterView};
use bytes::Bytes;
use cyprestore_common::config::Config;
use cyprestore_common::{
    EsId, Error, ExtentRouter, ReplicationMode, RequestType, Result, check_crc32c,
};
use cyprestore_storage::{IoReply, OpContext, Request, RequestInfo, RequestMgr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Engine parameters taken from the server configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub es_id: EsId,
    pub align_size: u64,
    pub extent_size: u64,
    pub replication_mode: ReplicationMode,
    pub log_engine: bool,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            es_id: EsId::new(config.server.es_id),
            align_size: config.storage.align_size,
            extent_size: config.storage.extent_size,
            replication_mode: config.replication.mode,
            log_engine: config.storage.log_engine,
        }
    }
}

/// Outcome counters
#[derive(Debug, Default)]
pub struct EngineStats {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
}

pub struct StorageEngine {
    config: EngineConfig,
    routers: Arc<RouterCache>,
    replicator: ReplicateEngine,
    bare: BareEngine,
    requests: Arc<RequestMgr>,
    stats: EngineStats,
}

impl StorageEngine {
    pub fn new(
        config: EngineConfig,
        routers: Arc<RouterCache>,
        replicator: ReplicateEngine,
        bare: BareEngine,
        requests: Arc<RequestMgr>,
    ) -> Self {
        Self {
            config,
            routers,
            replicator,
            bare,
            requests,
            stats: EngineStats::default(),
        }
    }

    /// A submission handle owning its own router view
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> EngineHandle {
        EngineHandle {
            engine: Arc::clone(self),
            routers: self.routers.view(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Writes that completed with at least one failed secondary
    #[must_use]
    pub fn partial_replications(&self) -> u64 {
        self.requests.partial_replications()
    }

    #[must_use]
    pub const fn requests(&self) -> &Arc<RequestMgr> {
        &self.requests
    }

    #[must_use]
    pub const fn replicator(&self) -> &ReplicateEngine {
        &self.replicator
    }

    #[must_use]
    pub const fn routers(&self) -> &Arc<RouterCache> {
        &self.routers
    }

    /// Run `req` through the pipeline; its callback fires exactly once
    pub fn process_request(&self, req: &Arc<Request>, routers: &mut RouterView) {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let info = match self.check(req, routers) {
            Ok(info) => info,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Request {} rejected: {}", req.id(), e);
                req.complete_local(Err(e));
                return;
            }
        };

        if info.req_type == RequestType::Write
            && self.config.replication_mode == ReplicationMode::Standard
            && let Err(e) = self.replicator.send(req)
        {
            // The local write goes ahead; completion counts the partial failure.
            warn!("Extent {}: {}", info.extent_id, e);
        }

        if matches!(
            info.req_type,
            RequestType::Delete | RequestType::ReclaimExtent
        ) {
            routers.invalidate(&info.extent_id);
        }

        if self.config.log_engine {
            req.complete_local(Err(Error::not_implemented("log engine")));
            return;
        }
        self.bare.process(req, &info);
    }

    fn check(&self, req: &Arc<Request>, routers: &mut RouterView) -> Result<RequestInfo> {
        let info = req.info()?;
        let router = Self::query_router(&info, routers)?;
        self.check_parameters(&info)?;
        if let Some(router) = router {
            self.check_ownership(info.req_type, &router)?;
            req.set_router(router);
        }
        Self::check_checksum(&info)?;
        Ok(info)
    }

    fn query_router(
        info: &RequestInfo,
        routers: &mut RouterView,
    ) -> Result<Option<Arc<ExtentRouter>>> {
        if info.req_type.is_extent_op() {
            return Ok(None);
        }
        routers.query(&info.extent_id).map(Some)
    }

    /// Validate range and payload against the device geometry
    pub fn check_parameters(&self, info: &RequestInfo) -> Result<()> {
        if info.extent_id.is_empty() {
            return Err(Error::invalid_argument("empty extent id"));
        }
        let align = self.config.align_size;
        if info.offset % align != 0 {
            return Err(Error::invalid_argument(format!(
                "offset {} is not aligned to {align}",
                info.offset
            )));
        }
        if info.size % align != 0 {
            return Err(Error::invalid_argument(format!(
                "size {} is not aligned to {align}",
                info.size
            )));
        }
        let end = info
            .offset
            .checked_add(info.size)
            .ok_or_else(|| Error::invalid_argument("offset + size overflows"))?;
        if end > self.config.extent_size {
            return Err(Error::invalid_argument(format!(
                "range {}+{} exceeds extent size {}",
                info.offset, info.size, self.config.extent_size
            )));
        }
        if !info.req_type.is_extent_op() && info.size == 0 {
            return Err(Error::invalid_argument(format!(
                "zero-length {}",
                info.req_type
            )));
        }
        if info.req_type.carries_payload() && info.payload.len() as u64 > info.size {
            return Err(Error::invalid_argument(format!(
                "payload of {} bytes exceeds size {}",
                info.payload.len(),
                info.size
            )));
        }
        Ok(())
    }

    /// Check this node may serve `req_type` for the routed extent
    pub fn check_ownership(&self, req_type: RequestType, router: &ExtentRouter) -> Result<()> {
        let me = self.config.es_id;
        let primary = router.is_primary(me);
        let secondary = router.is_secondary(me);
        let allowed = match req_type {
            RequestType::Read => primary,
            RequestType::Write => match self.config.replication_mode {
                ReplicationMode::Standard => primary,
                ReplicationMode::Star => primary || secondary,
            },
            RequestType::Replicate => secondary,
            RequestType::Scrub => primary || secondary,
            RequestType::Delete | RequestType::ReclaimExtent | RequestType::Noop => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::NoPermission(format!(
                "{me} may not {req_type} extent {} (primary {}, version {})",
                router.extent_id, router.primary.id, router.version
            )))
        }
    }

    fn check_checksum(info: &RequestInfo) -> Result<()> {
        match info.crc32 {
            Some(expected) if info.req_type.carries_payload() => {
                check_crc32c(&info.payload, expected)
            }
            _ => Ok(()),
        }
    }
}

/// Per-worker entry point into the engine
///
/// Each handle caches routers privately; create one per worker thread.
pub struct EngineHandle {
    engine: Arc<StorageEngine>,
    routers: RouterView,
}

impl EngineHandle {
    /// Submit an operation
    ///
    /// Fails fast with `RingFull` when every pooled request is in flight; in
    /// that case the callback in `ctx` is dropped without being called.
    pub fn submit(&mut self, req_type: RequestType, ctx: OpContext) -> Result<()> {
        let req = self.engine.requests.acquire(req_type)?;
        req.set_context(ctx);
        self.engine.process_request(&req, &mut self.routers);
        Ok(())
    }

    pub fn read(
        &mut self,
        extent_id: &str,
        offset: u64,
        size: u64,
        done: impl FnOnce(Result<IoReply>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            RequestType::Read,
            OpContext::new(extent_id, offset, size).on_done(done),
        )
    }

    pub fn write(
        &mut self,
        extent_id: &str,
        offset: u64,
        size: u64,
        payload: Bytes,
        crc32: Option<u32>,
        done: impl FnOnce(Result<IoReply>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            RequestType::Write,
            OpContext::new(extent_id, offset, size)
                .with_payload(payload, crc32)
                .on_done(done),
        )
    }

    pub fn replicate(
        &mut self,
        extent_id: &str,
        offset: u64,
        size: u64,
        payload: Bytes,
        crc32: Option<u32>,
        done: impl FnOnce(Result<IoReply>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            RequestType::Replicate,
            OpContext::new(extent_id, offset, size)
                .with_payload(payload, crc32)
                .on_done(done),
        )
    }

    pub fn scrub(
        &mut self,
        extent_id: &str,
        offset: u64,
        size: u64,
        done: impl FnOnce(Result<IoReply>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            RequestType::Scrub,
            OpContext::new(extent_id, offset, size).on_done(done),
        )
    }

    pub fn delete(
        &mut self,
        extent_id: &str,
        done: impl FnOnce(Result<IoReply>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            RequestType::Delete,
            OpContext::new(extent_id, 0, 0).on_done(done),
        )
    }

    pub fn reclaim_extent(
        &mut self,
        extent_id: &str,
        done: impl FnOnce(Result<IoReply>) + Send + 'static,
    ) -> Result<()> {
        self.submit(
            RequestType::ReclaimExtent,
            OpContext::new(extent_id, 0, 0).on_done(done),
        )
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }
}
