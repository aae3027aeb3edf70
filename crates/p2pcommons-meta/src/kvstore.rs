//! Embedded key-value store backing the local index.
//!
//! `MemoryKvStore` keeps everything in a BTreeMap and is used when
//! persistence is disabled and in tests. `SledKvStore` persists to a sled
//! database under the engine's base directory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::MetaError;

/// A key-value pair.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Ordered byte-keyed store.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Scan all keys with the given prefix, in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically apply a batch of puts and deletes.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;

    /// Make prior writes durable. A no-op for volatile stores.
    fn flush(&self) -> Result<(), MetaError> {
        Ok(())
    }
}

/// A single operation in a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Volatile store backed by a BTreeMap.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> MetaError {
    MetaError::KvError(e.to_string())
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data
            .range::<Vec<u8>, _>(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(poisoned)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Persistent store backed by sled.
#[derive(Clone)]
pub struct SledKvStore {
    db: sled::Db,
}

impl SledKvStore {
    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MetaError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "opened local index database");
        Ok(Self { db })
    }
}

impl KvStore for SledKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        self.db.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        self.db
            .scan_prefix(prefix)
            .map(|item| {
                let (k, v) = item?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.db.contains_key(key)?)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.insert(key, value),
                BatchOp::Delete { key } => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), MetaError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        store.put(b"dir/a".to_vec(), b"1".to_vec()).unwrap();
        store.put(b"dir/b".to_vec(), b"2".to_vec()).unwrap();
        store.put(b"other/x".to_vec(), b"3".to_vec()).unwrap();

        assert_eq!(store.get(b"dir/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"dir/z").unwrap(), None);

        let scanned = store.scan_prefix(b"dir/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"dir/a");
        assert_eq!(scanned[1].0, b"dir/b");

        store
            .write_batch(vec![
                BatchOp::Delete {
                    key: b"dir/a".to_vec(),
                },
                BatchOp::Put {
                    key: b"dir/c".to_vec(),
                    value: b"4".to_vec(),
                },
            ])
            .unwrap();
        assert!(!store.contains_key(b"dir/a").unwrap());
        assert!(store.contains_key(b"dir/c").unwrap());

        store.delete(b"other/x").unwrap();
        store.delete(b"missing").unwrap();
        assert!(store.scan_prefix(b"other/").unwrap().is_empty());
        store.flush().unwrap();
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryKvStore::new());
    }

    #[test]
    fn test_sled_store() {
        let dir = tempfile::TempDir::new().unwrap();
        exercise(&SledKvStore::open(dir.path().join("db")).unwrap());
    }

    #[test]
    fn test_sled_store_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let store = SledKvStore::open(&path).unwrap();
            store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
            store.flush().unwrap();
        }
        let store = SledKvStore::open(&path).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
