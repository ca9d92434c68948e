//! Durable key-value store for engine metadata
//!
//! The extent layer only needs get/put/delete and a prefix scan over string
//! keys. [`RedbKvStore`] is the durable implementation (every write is its
//! own committed transaction); [`MemKvStore`] is a volatile stand-in.

use cyprestore_common::{Error, Result};
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Single table holding all engine metadata keys
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("es_meta");

/// Error type for redb plumbing
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<KvError> for Error {
    fn from(e: KvError) -> Self {
        Error::Kv(e.to_string())
    }
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Minimal durable map of string keys to byte values
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite; durable once this returns
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Persistent store backed by redb
pub struct RedbKvStore {
    db: Database,
}

impl RedbKvStore {
    /// Open (or create) the redb database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::open_inner(path.as_ref())?)
    }

    fn open_inner(path: &Path) -> KvResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        info!("Opened extent metadata store at {:?}", path);
        Ok(Self { db })
    }

    fn get_inner(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put_inner(&self, key: &str, value: &[u8]) -> KvResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_inner(&self, key: &str) -> KvResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(META)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_inner(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(META)?;
        let mut result = Vec::new();
        for entry in table.range(prefix..)? {
            let entry = entry?;
            let key = entry.0.value();
            if !key.starts_with(prefix) {
                break;
            }
            result.push((key.to_string(), entry.1.value().to_vec()));
        }
        Ok(result)
    }
}

impl KvStore for RedbKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_inner(key)?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        Ok(self.put_inner(key, value)?)
    }

    fn delete(&self, key: &str) -> Result<()> {
        Ok(self.delete_inner(key)?)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.scan_inner(prefix)?)
    }
}

/// Volatile store, for tests and throwaway nodes
#[derive(Debug, Default)]
pub struct MemKvStore {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .map
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn KvStore) {
        assert!(store.get("extent_loc_a").unwrap().is_none());

        store.put("extent_loc_a", b"1").unwrap();
        store.put("extent_loc_b", b"2").unwrap();
        store.put("other_c", b"3").unwrap();
        assert_eq!(store.get("extent_loc_a").unwrap().unwrap(), b"1");

        store.put("extent_loc_a", b"11").unwrap();
        let scanned = store.scan_prefix("extent_loc_").unwrap();
        assert_eq!(
            scanned,
            vec![
                ("extent_loc_a".to_string(), b"11".to_vec()),
                ("extent_loc_b".to_string(), b"2".to_vec()),
            ]
        );

        store.delete("extent_loc_a").unwrap();
        store.delete("missing").unwrap();
        assert!(store.get("extent_loc_a").unwrap().is_none());
        assert_eq!(store.scan_prefix("extent_loc_").unwrap().len(), 1);
    }

    #[test]
    fn test_mem_store() {
        exercise(&MemKvStore::new());
    }

    #[test]
    fn test_redb_store() {
        let dir = TempDir::new().unwrap();
        let store = RedbKvStore::open(dir.path().join("meta.redb")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_redb_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("meta.redb");
        {
            let store = RedbKvStore::open(&path).unwrap();
            store.put("extent_loc_x", b"persisted").unwrap();
        }
        let store = RedbKvStore::open(&path).unwrap();
        assert_eq!(store.get("extent_loc_x").unwrap().unwrap(), b"persisted");
    }
}
