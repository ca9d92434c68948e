//! ExtentServer context
//!
//! Owns every long-lived component of one node and wires them together at
//! startup: device, space allocator, extent locations, memory and request
//! pools, router cache and the storage engine.

use crate::bare_engine::BareEngine;
use crate::replicate::{PeerPool, ReplicateEngine};
use crate::router::{RouterCache, RouterClient};
use crate::storage_engine::{EngineConfig, EngineHandle, StorageEngine};
use cyprestore_common::config::Config;
use cyprestore_common::{DeviceType, EsInstance, Error, Result};
use cyprestore_storage::{
    BitmapAllocator, BlockDevice, ExtentLocationMgr, FileBlockDevice, FileDeviceConfig, IoMemConfig,
    IoMemMgr, KvStore, RedbKvStore, RequestMgr,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info};

/// External collaborators of a node
pub struct Collaborators {
    pub router: Arc<dyn RouterClient>,
    pub peers: Arc<dyn PeerPool>,
}

pub struct ExtentServer {
    config: Config,
    instance: EsInstance,
    device: Arc<dyn BlockDevice>,
    space: Arc<BitmapAllocator>,
    locations: Arc<ExtentLocationMgr>,
    mem: Arc<IoMemMgr>,
    engine: Arc<StorageEngine>,
}

impl ExtentServer {
    /// Start a node on the configured device and metadata store
    pub fn start(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let device: Arc<dyn BlockDevice> = match config.storage.device_type {
            DeviceType::File => Arc::new(FileBlockDevice::new(FileDeviceConfig::from(
                &config.storage,
            ))?),
            DeviceType::Nvme => {
                return Err(Error::not_implemented(
                    "nvme device type needs an external block device; use start_with",
                ));
            }
        };
        let store = Arc::new(RedbKvStore::open(&config.metadata.path)?);
        Self::start_with(config, device, store, collaborators)
    }

    /// Start a node on a caller-supplied device and store
    ///
    /// The device is initialized and opened here; extent locations are
    /// replayed from `store` before any request is accepted.
    pub fn start_with(
        config: Config,
        device: Arc<dyn BlockDevice>,
        store: Arc<dyn KvStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let instance = config.server.instance();
        info!("Starting ExtentServer {} at {}", instance.id, instance.address);

        device.init_env()?;
        device.open()?;

        let storage = &config.storage;
        let space = Arc::new(BitmapAllocator::new(
            device.capacity(),
            storage.block_size,
            storage.blocks_per_chunk,
        )?);
        let locations = Arc::new(ExtentLocationMgr::new(
            storage.extent_size,
            space.clone(),
            store,
        ));
        let loaded = locations.load_extents()?;

        let mem = Arc::new(IoMemMgr::new(&IoMemConfig::from(&config.pools))?);
        let requests = RequestMgr::new(
            config.pools.request_pool_size,
            Duration::from_millis(config.server.slow_request_ms),
        )?;

        let engine = Arc::new(StorageEngine::new(
            EngineConfig::from(&config),
            Arc::new(RouterCache::new(collaborators.router)),
            ReplicateEngine::new(collaborators.peers),
            BareEngine::new(locations.clone(), mem.clone(), device.clone()),
            requests,
        ));

        info!(
            "ExtentServer {} ready: {} extents, {} of {} blocks free, replication {:?}",
            instance.id,
            loaded,
            space.free_blocks(),
            space.total_blocks(),
            config.replication.mode
        );
        Ok(Self {
            config,
            instance,
            device,
            space,
            locations,
            mem,
            engine,
        })
    }

    /// A new submission handle; use one per worker
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    /// Periodic device housekeeping and pool report
    pub fn period_admin(&self) {
        self.device.period_device_admin();
        let requests = self.engine.requests();
        let stats = self.engine.stats();
        info!(
            "ES {}: extents={} free_blocks={} requests_in_flight={} submitted={} rejected={} partial_replications={}",
            self.instance.id,
            self.locations.extent_count(),
            self.space.free_blocks(),
            requests.in_flight(),
            stats.submitted.load(Ordering::Relaxed),
            stats.rejected.load(Ordering::Relaxed),
            requests.partial_replications()
        );
        for class in self.mem.classes() {
            if class.outstanding() > 0 {
                info!(
                    "  mem {}: outstanding={} created={}",
                    class.name(),
                    class.outstanding(),
                    class.created()
                );
            }
        }
    }

    /// Stop the device; in-flight device requests fail
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down ExtentServer {}", self.instance.id);
        let closed = self.device.close();
        if let Err(e) = &closed {
            error!("Failed to close device: {}", e);
        }
        self.device.close_env();
        closed
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn instance(&self) -> &EsInstance {
        &self.instance
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    #[must_use]
    pub const fn space(&self) -> &Arc<BitmapAllocator> {
        &self.space
    }

    #[must_use]
    pub const fn locations(&self) -> &Arc<ExtentLocationMgr> {
        &self.locations
    }

    #[must_use]
    pub const fn mem(&self) -> &Arc<IoMemMgr> {
        &self.mem
    }
}
