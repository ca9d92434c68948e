//! Logical extent to physical unit mapping
//!
//! Each extent written on this node owns one [`AUnit`] of `extent_size`
//! bytes, allocated on first write. Mappings are persisted under
//! `extent_loc_<extent_id>` before they become visible in the in-memory map,
//! so after a crash an extent is either fully recorded or absent.
//!
//! Lookups take the map's read lock only. The first allocation for an extent
//! is serialized through a per-extent mutex so concurrent first writers agree
//! on a single unit.

use crate::bitmap::SpaceAlloc;
use crate::kv::KvStore;
use cyprestore_common::{AUnit, Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key prefix for persisted locations
pub const EXTENT_LOC_PREFIX: &str = "extent_loc_";

/// Persisted location of one extent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLocation {
    pub offset: u64,
    pub size: u64,
    pub extent_id: String,
}

impl ExtentLocation {
    #[must_use]
    pub fn aunit(&self) -> AUnit {
        AUnit::new(self.offset, self.size)
    }

    #[must_use]
    pub fn key(&self) -> String {
        location_key(&self.extent_id)
    }
}

/// Store key for an extent's location
#[must_use]
pub fn location_key(extent_id: &str) -> String {
    format!("{EXTENT_LOC_PREFIX}{extent_id}")
}

/// Per-extent mutexes, created on demand and dropped when unused
#[derive(Debug, Default)]
struct ExtentLockMgr {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExtentLockMgr {
    fn with_lock<R>(&self, extent_id: &str, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(
            self.locks
                .entry(extent_id.to_string())
                .or_default()
                .value(),
        );
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.locks
            .remove_if(extent_id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Owns the extent -> unit map for this node
pub struct ExtentLocationMgr {
    extent_size: u64,
    space: Arc<dyn SpaceAlloc>,
    store: Arc<dyn KvStore>,
    map: RwLock<HashMap<String, ExtentLocation>>,
    locks: ExtentLockMgr,
}

impl ExtentLocationMgr {
    pub fn new(extent_size: u64, space: Arc<dyn SpaceAlloc>, store: Arc<dyn KvStore>) -> Self {
        Self {
            extent_size,
            space,
            store,
            map: RwLock::new(HashMap::new()),
            locks: ExtentLockMgr::default(),
        }
    }

    #[must_use]
    pub const fn extent_size(&self) -> u64 {
        self.extent_size
    }

    /// Resolve where `extent_id` lives, optionally allocating it
    ///
    /// Without `alloc_if_not_exists` a missing extent yields
    /// [`Error::ExtentEmpty`], which readers turn into zero-filled data.
    pub fn query_location(
        &self,
        extent_id: &str,
        alloc_if_not_exists: bool,
    ) -> Result<ExtentLocation> {
        if let Some(loc) = self.map.read().get(extent_id) {
            return Ok(loc.clone());
        }
        if !alloc_if_not_exists {
            return Err(Error::ExtentEmpty(extent_id.to_string()));
        }

        self.locks.with_lock(extent_id, || {
            // Another writer may have won the race while we waited.
            if let Some(loc) = self.map.read().get(extent_id) {
                return Ok(loc.clone());
            }

            let aunit = self.space.allocate(self.extent_size)?;
            let loc = ExtentLocation {
                offset: aunit.offset,
                size: aunit.size,
                extent_id: extent_id.to_string(),
            };

            if let Err(e) = self.persist(&loc) {
                warn!("Failed to persist location of extent {}: {}", extent_id, e);
                if let Err(free_err) = self.space.free(&aunit) {
                    warn!(
                        "Failed to release unit {}+{} after persist failure: {}",
                        aunit.offset, aunit.size, free_err
                    );
                }
                return Err(e);
            }

            debug!(
                "Allocated extent {} at offset {} size {}",
                extent_id, loc.offset, loc.size
            );
            self.map.write().insert(extent_id.to_string(), loc.clone());
            Ok(loc)
        })
    }

    /// Drop an extent's mapping and release its space
    ///
    /// Returns the removed location, or `None` if the extent was never written.
    pub fn delete_extent(&self, extent_id: &str) -> Result<Option<ExtentLocation>> {
        self.locks.with_lock(extent_id, || {
            let Some(loc) = self.map.read().get(extent_id).cloned() else {
                return Ok(None);
            };

            // Forget the durable record before the space can be reused.
            self.store.delete(&loc.key())?;
            self.map.write().remove(extent_id);
            self.space.free(&loc.aunit())?;

            debug!("Deleted extent {} at offset {}", extent_id, loc.offset);
            Ok(Some(loc))
        })
    }

    /// Rebuild the map and allocator state from the store
    pub fn load_extents(&self) -> Result<usize> {
        let entries = self.store.scan_prefix(EXTENT_LOC_PREFIX)?;
        let mut map = self.map.write();
        for (key, bytes) in &entries {
            let loc: ExtentLocation = bincode::deserialize(bytes)
                .map_err(|e| Error::Serialization(format!("decode {key}: {e}")))?;
            self.space.mark(&loc.aunit())?;
            map.insert(loc.extent_id.clone(), loc);
        }
        info!("Loaded {} extent locations", map.len());
        Ok(map.len())
    }

    /// Extents currently mapped
    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.map.read().len()
    }

    /// Per-extent locks currently held or awaited
    #[must_use]
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    fn persist(&self, loc: &ExtentLocation) -> Result<()> {
        let bytes = bincode::serialize(loc)
            .map_err(|e| Error::Serialization(format!("encode {}: {e}", loc.extent_id)))?;
        self.store.put(&loc.key(), &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::BitmapAllocator;
    use crate::kv::{MemKvStore, RedbKvStore};
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    /// Counts puts so tests can assert how often a mapping was persisted
    #[derive(Default)]
    struct CountingStore {
        inner: MemKvStore,
        puts: AtomicUsize,
        fail_puts: bool,
    }

    impl KvStore for CountingStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            if self.fail_puts {
                return Err(Error::Kv("injected".into()));
            }
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, value)
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
            self.inner.scan_prefix(prefix)
        }
    }

    fn space() -> Arc<BitmapAllocator> {
        Arc::new(BitmapAllocator::new(64 * MIB, MIB, 16).unwrap())
    }

    #[test]
    fn test_query_without_alloc_is_empty() {
        let mgr = ExtentLocationMgr::new(4 * MIB, space(), Arc::new(MemKvStore::new()));
        assert!(matches!(
            mgr.query_location("e2", false),
            Err(Error::ExtentEmpty(id)) if id == "e2"
        ));
        assert_eq!(mgr.extent_count(), 0);
    }

    #[test]
    fn test_query_allocates_once() {
        let space = space();
        let store = Arc::new(CountingStore::default());
        let mgr = ExtentLocationMgr::new(4 * MIB, space.clone(), store.clone());

        let first = mgr.query_location("e1", true).unwrap();
        assert_eq!(first.size, 4 * MIB);
        let second = mgr.query_location("e1", true).unwrap();
        let read = mgr.query_location("e1", false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, read);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert_eq!(space.free_blocks(), 60);
    }

    #[test]
    fn test_concurrent_first_access_allocates_once() {
        let space = space();
        let store = Arc::new(CountingStore::default());
        let mgr = Arc::new(ExtentLocationMgr::new(4 * MIB, space.clone(), store.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    mgr.query_location("hot", true).unwrap()
                })
            })
            .collect();

        let offsets: HashSet<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().offset)
            .collect();
        assert_eq!(offsets.len(), 1);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert_eq!(space.free_blocks(), 60);
        assert_eq!(mgr.active_locks(), 0);
    }

    #[test]
    fn test_persist_failure_releases_space() {
        let space = space();
        let store = Arc::new(CountingStore {
            fail_puts: true,
            ..CountingStore::default()
        });
        let mgr = ExtentLocationMgr::new(4 * MIB, space.clone(), store);

        assert!(matches!(mgr.query_location("e1", true), Err(Error::Kv(_))));
        assert_eq!(space.free_blocks(), 64);
        assert_eq!(mgr.extent_count(), 0);
    }

    #[test]
    fn test_delete_extent_frees_space() {
        let space = space();
        let store = Arc::new(MemKvStore::new());
        let mgr = ExtentLocationMgr::new(4 * MIB, space.clone(), store.clone());

        let loc = mgr.query_location("e1", true).unwrap();
        assert_eq!(store.len(), 1);

        let removed = mgr.delete_extent("e1").unwrap().unwrap();
        assert_eq!(removed, loc);
        assert_eq!(store.len(), 0);
        assert_eq!(space.free_blocks(), 64);
        assert!(mgr.query_location("e1", false).is_err());

        assert!(mgr.delete_extent("e1").unwrap().is_none());
    }

    #[test]
    fn test_load_extents_rebuilds_allocator() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.redb");
        let written: Vec<ExtentLocation> = {
            let store = Arc::new(RedbKvStore::open(&path).unwrap());
            let mgr = ExtentLocationMgr::new(4 * MIB, space(), store);
            ["a", "b", "c"]
                .iter()
                .map(|id| mgr.query_location(id, true).unwrap())
                .collect()
        };

        let space = space();
        let store = Arc::new(RedbKvStore::open(&path).unwrap());
        let mgr = ExtentLocationMgr::new(4 * MIB, space.clone(), store);
        assert_eq!(mgr.load_extents().unwrap(), 3);
        assert_eq!(space.free_blocks(), 64 - 12);
        for loc in &written {
            assert_eq!(&mgr.query_location(&loc.extent_id, false).unwrap(), loc);
            assert!(space.is_allocated(loc.offset));
        }

        // New allocations avoid replayed units.
        let fresh = mgr.query_location("d", true).unwrap();
        assert!(written.iter().all(|l| l.offset != fresh.offset));
    }

    #[test]
    fn test_location_key() {
        assert_eq!(location_key("e1"), "extent_loc_e1");
    }
}
