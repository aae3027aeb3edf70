//! Local index of module envelopes.
//!
//! Key layout inside the [`KvStore`]:
//!
//! - `localdb/<hex key>` holds the codec-encoded latest envelope,
//! - `seeddb/<hex discovery key>` holds a JSON [`SeedEntry`],
//! - `idx/<field>/<lowercased value>\0<hex key>` are secondary index
//!   entries for `title` and `description`.
//!
//! Secondary entries are rewritten in the same batch as the envelope they
//! point to, so they never disagree with `localdb`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec;
use crate::error::MetaError;
use crate::kvstore::{BatchOp, KvStore};
use crate::types::{DiscoveryKey, HyperKey, ModuleRecord, StorageEnvelope};

const LOCALDB: &[u8] = b"localdb/";
const SEEDDB: &[u8] = b"seeddb/";
const IDX: &[u8] = b"idx/";

/// Fields carrying a secondary index.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexField {
    /// The module title.
    Title,
    /// The module description.
    Description,
}

impl IndexField {
    /// All indexed fields.
    pub const ALL: [IndexField; 2] = [IndexField::Title, IndexField::Description];

    /// Field name as it appears in the record.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexField::Title => "title",
            IndexField::Description => "description",
        }
    }

    fn value<'a>(&self, record: &'a ModuleRecord) -> &'a str {
        match self {
            IndexField::Title => &record.title,
            IndexField::Description => &record.description,
        }
    }

    fn prefix(&self) -> Vec<u8> {
        let mut p = IDX.to_vec();
        p.extend_from_slice(self.as_str().as_bytes());
        p.push(b'/');
        p
    }

    fn entry_key(&self, record: &ModuleRecord, key: &HyperKey) -> Vec<u8> {
        let mut k = self.prefix();
        k.extend_from_slice(self.value(record).to_lowercase().as_bytes());
        k.push(0);
        k.extend_from_slice(key.to_hex().as_bytes());
        k
    }
}

/// Options a module was joined to the swarm with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOptions {
    /// Announce this peer as a holder of the module.
    pub announce: bool,
    /// Look up other peers holding the module.
    pub lookup: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            announce: true,
            lookup: true,
        }
    }
}

/// A module this peer keeps seeding across restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedEntry {
    /// Hex module key.
    pub key: String,
    /// How the module was joined.
    pub options: JoinOptions,
}

fn localdb_key(key: &HyperKey) -> Vec<u8> {
    [LOCALDB, key.to_hex().as_bytes()].concat()
}

fn seeddb_key(dkey: &DiscoveryKey) -> Vec<u8> {
    [SEEDDB, dkey.to_hex().as_bytes()].concat()
}

/// Ordered store of the latest envelope per module.
#[derive(Clone)]
pub struct LocalIndex {
    kv: Arc<dyn KvStore>,
}

impl LocalIndex {
    /// Creates an index over `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Returns the latest envelope for `key`.
    pub fn get(&self, key: &HyperKey) -> Result<Option<StorageEnvelope>, MetaError> {
        match self.kv.get(&localdb_key(key))? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns true if an envelope is stored for `key`.
    pub fn contains(&self, key: &HyperKey) -> Result<bool, MetaError> {
        self.kv.contains_key(&localdb_key(key))
    }

    /// Stores `envelope` as the latest state of its module.
    pub fn put(&self, envelope: &StorageEnvelope) -> Result<(), MetaError> {
        let key = envelope.key().ok_or_else(|| {
            MetaError::KvError(format!("envelope url '{}' is not a module url", envelope.raw_json.url))
        })?;
        let bytes = codec::encode(envelope)?;

        let mut ops = Vec::new();
        if let Some(previous) = self.get(&key)? {
            for field in IndexField::ALL {
                ops.push(BatchOp::Delete {
                    key: field.entry_key(&previous.raw_json, &key),
                });
            }
        }
        for field in IndexField::ALL {
            ops.push(BatchOp::Put {
                key: field.entry_key(&envelope.raw_json, &key),
                value: key.to_hex().into_bytes(),
            });
        }
        ops.push(BatchOp::Put {
            key: localdb_key(&key),
            value: bytes,
        });
        self.kv.write_batch(ops)?;
        debug!(key = %key, version = envelope.version, "indexed module");
        Ok(())
    }

    /// Removes the envelope for `key` and its secondary entries.
    /// Returns the removed envelope, if any.
    pub fn delete(&self, key: &HyperKey) -> Result<Option<StorageEnvelope>, MetaError> {
        let Some(previous) = self.get(key)? else {
            return Ok(None);
        };
        let mut ops: Vec<BatchOp> = IndexField::ALL
            .iter()
            .map(|field| BatchOp::Delete {
                key: field.entry_key(&previous.raw_json, key),
            })
            .collect();
        ops.push(BatchOp::Delete {
            key: localdb_key(key),
        });
        self.kv.write_batch(ops)?;
        debug!(key = %key, "removed module from index");
        Ok(Some(previous))
    }

    /// Returns every stored envelope, ordered by key.
    pub fn list(&self) -> Result<Vec<StorageEnvelope>, MetaError> {
        self.kv
            .scan_prefix(LOCALDB)?
            .into_iter()
            .map(|(_, bytes)| Ok(codec::decode(&bytes)?))
            .collect()
    }

    /// Returns modules whose `field` contains `query`, ignoring case.
    pub fn filter(&self, field: IndexField, query: &str) -> Result<Vec<StorageEnvelope>, MetaError> {
        let needle = query.to_lowercase();
        let prefix = field.prefix();
        let mut out = Vec::new();
        for (k, v) in self.kv.scan_prefix(&prefix)? {
            let rest = &k[prefix.len()..];
            let Some(sep) = rest.iter().rposition(|b| *b == 0) else {
                continue;
            };
            let value = String::from_utf8_lossy(&rest[..sep]);
            if !value.contains(&needle) {
                continue;
            }
            let Some(key) = std::str::from_utf8(&v).ok().and_then(HyperKey::from_hex) else {
                continue;
            };
            if let Some(envelope) = self.get(&key)? {
                out.push(envelope);
            }
        }
        Ok(out)
    }

    /// Records that `key` should be seeded.
    pub fn put_seed(&self, key: &HyperKey, options: JoinOptions) -> Result<(), MetaError> {
        let entry = SeedEntry {
            key: key.to_hex(),
            options,
        };
        self.kv
            .put(seeddb_key(&key.discovery_key()), serde_json::to_vec(&entry)?)
    }

    /// Forgets the seed entry of `key`.
    pub fn delete_seed(&self, key: &HyperKey) -> Result<(), MetaError> {
        self.kv.delete(&seeddb_key(&key.discovery_key()))
    }

    /// Returns every seed entry.
    pub fn seeds(&self) -> Result<Vec<SeedEntry>, MetaError> {
        self.kv
            .scan_prefix(SEEDDB)?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_slice(&v)?))
            .collect()
    }

    /// Makes prior writes durable.
    pub fn flush(&self) -> Result<(), MetaError> {
        self.kv.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use crate::types::{Links, ModuleKind, ModuleType};

    fn envelope(n: u8, title: &str, description: &str) -> StorageEnvelope {
        let record = ModuleRecord {
            title: title.into(),
            description: description.into(),
            url: HyperKey::from_bytes([n; 32]).to_url(),
            links: Links::default(),
            p2pcommons: ModuleKind::empty(ModuleType::Content),
        };
        StorageEnvelope::new(record, true, 1)
    }

    fn index() -> LocalIndex {
        LocalIndex::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_put_get_delete() {
        let index = index();
        let env = envelope(1, "Hello", "world");
        let key = env.key().unwrap();
        index.put(&env).unwrap();
        assert_eq!(index.get(&key).unwrap(), Some(env.clone()));
        assert!(index.contains(&key).unwrap());
        assert_eq!(index.delete(&key).unwrap(), Some(env));
        assert_eq!(index.get(&key).unwrap(), None);
        assert!(index.delete(&key).unwrap().is_none());
    }

    #[test]
    fn test_filter_is_case_insensitive_substring() {
        let index = index();
        index.put(&envelope(1, "Quantum Gravity", "notes")).unwrap();
        index.put(&envelope(2, "Gravity waves", "data")).unwrap();
        index.put(&envelope(3, "Botany", "Leaf NOTES")).unwrap();

        assert_eq!(index.filter(IndexField::Title, "GRAVITY").unwrap().len(), 2);
        assert_eq!(index.filter(IndexField::Description, "notes").unwrap().len(), 2);
        assert!(index.filter(IndexField::Title, "zzz").unwrap().is_empty());
    }

    #[test]
    fn test_secondary_entries_follow_updates() {
        let index = index();
        let mut env = envelope(1, "old title", "");
        index.put(&env).unwrap();
        env.raw_json.title = "new title".into();
        index.put(&env).unwrap();
        assert!(index.filter(IndexField::Title, "old").unwrap().is_empty());
        assert_eq!(index.filter(IndexField::Title, "new").unwrap().len(), 1);

        index.delete(&env.key().unwrap()).unwrap();
        assert!(index.filter(IndexField::Title, "title").unwrap().is_empty());
    }

    #[test]
    fn test_list_and_seeds() {
        let index = index();
        index.put(&envelope(2, "b", "")).unwrap();
        index.put(&envelope(1, "a", "")).unwrap();
        let titles: Vec<_> = index
            .list()
            .unwrap()
            .into_iter()
            .map(|e| e.raw_json.title)
            .collect();
        assert_eq!(titles, vec!["a", "b"]);

        let key = HyperKey::from_bytes([7; 32]);
        index.put_seed(&key, JoinOptions::default()).unwrap();
        assert_eq!(index.seeds().unwrap()[0].key, key.to_hex());
        index.delete_seed(&key).unwrap();
        assert!(index.seeds().unwrap().is_empty());
    }
}
