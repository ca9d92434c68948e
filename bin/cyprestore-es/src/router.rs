//! Extent router cache
//!
//! Routers come from the topology service through a [`RouterClient`]. The
//! shared [`RouterCache`] holds every router fetched by this node; each
//! engine handle owns a [`RouterView`], a private copy it reads without
//! locking. Invalidation removes the shared entry and bumps an epoch; views
//! drop their private copies the next time they see a newer epoch.

use cyprestore_common::{EsInstance, Error, ExtentRouter, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Topology service lookup
pub trait RouterClient: Send + Sync {
    fn query_router(&self, extent_id: &str) -> Result<ExtentRouter>;
}

/// Routes every extent to this node with no secondaries
///
/// Used when the server runs without a topology service.
#[derive(Debug, Clone)]
pub struct StandaloneRouter {
    instance: EsInstance,
}

impl StandaloneRouter {
    #[must_use]
    pub const fn new(instance: EsInstance) -> Self {
        Self { instance }
    }
}

impl RouterClient for StandaloneRouter {
    fn query_router(&self, extent_id: &str) -> Result<ExtentRouter> {
        Ok(ExtentRouter {
            extent_id: extent_id.to_string(),
            primary: self.instance.clone(),
            secondaries: Vec::new(),
            version: 0,
        })
    }
}

/// Process-wide router cache
pub struct RouterCache {
    client: Arc<dyn RouterClient>,
    entries: RwLock<HashMap<String, Arc<ExtentRouter>>>,
    epoch: AtomicU64,
}

impl RouterCache {
    pub fn new(client: Arc<dyn RouterClient>) -> Self {
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Cached router for `extent_id`, fetched from the topology service on miss
    pub fn get(&self, extent_id: &str) -> Result<Arc<ExtentRouter>> {
        if let Some(router) = self.entries.read().get(extent_id) {
            return Ok(Arc::clone(router));
        }

        let router = self
            .client
            .query_router(extent_id)
            .map_err(|e| Error::QueryRouterFail {
                extent_id: extent_id.to_string(),
                reason: e.to_string(),
            })?;
        let router = Arc::new(router);
        debug!(
            "Cached router for {}: primary {}, {} secondaries, version {}",
            extent_id,
            router.primary.id,
            router.secondaries.len(),
            router.version
        );
        self.entries
            .write()
            .insert(extent_id.to_string(), Arc::clone(&router));
        Ok(router)
    }

    /// Forget `extent_id` here and in every view
    pub fn invalidate(&self, extent_id: &str) {
        // Remove before bumping so a view that sees the new epoch refetches.
        self.entries.write().remove(extent_id);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// A private view for one worker
    #[must_use]
    pub fn view(self: &Arc<Self>) -> RouterView {
        RouterView {
            cache: Arc::clone(self),
            epoch: self.epoch(),
            local: HashMap::new(),
        }
    }
}

/// Per-worker router cache
pub struct RouterView {
    cache: Arc<RouterCache>,
    epoch: u64,
    local: HashMap<String, Arc<ExtentRouter>>,
}

impl RouterView {
    pub fn query(&mut self, extent_id: &str) -> Result<Arc<ExtentRouter>> {
        let epoch = self.cache.epoch();
        if epoch != self.epoch {
            self.local.clear();
            self.epoch = epoch;
        }
        if let Some(router) = self.local.get(extent_id) {
            return Ok(Arc::clone(router));
        }
        let router = self.cache.get(extent_id)?;
        self.local
            .insert(extent_id.to_string(), Arc::clone(&router));
        Ok(router)
    }

    pub fn invalidate(&mut self, extent_id: &str) {
        self.local.remove(extent_id);
        self.cache.invalidate(extent_id);
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<RouterCache> {
        &self.cache
    }
}
