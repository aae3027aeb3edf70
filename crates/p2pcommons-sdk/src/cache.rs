//! Cache of open drive handles.
//!
//! Keyed by discovery key plus an optional checkout version. Versioned
//! entries are immutable snapshots and are only ever replaced, never written
//! through.

use std::sync::Arc;

use dashmap::DashMap;
use p2pcommons_meta::DiscoveryKey;
use tracing::debug;

use crate::drive::Drive;

/// Composite cache key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleKey {
    /// Discovery key of the module.
    pub dkey: DiscoveryKey,
    /// Checkout version, `None` for the live drive.
    pub version: Option<u64>,
}

impl HandleKey {
    /// Key of the live drive.
    pub fn latest(dkey: DiscoveryKey) -> Self {
        Self { dkey, version: None }
    }

    /// Key of a checkout.
    pub fn at(dkey: DiscoveryKey, version: u64) -> Self {
        Self {
            dkey,
            version: Some(version),
        }
    }
}

/// Shared map of open handles.
#[derive(Default)]
pub struct HandleCache {
    handles: DashMap<HandleKey, Arc<dyn Drive>>,
}

impl HandleCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached handle for `key`.
    pub fn get(&self, key: &HandleKey) -> Option<Arc<dyn Drive>> {
        self.handles.get(key).map(|h| Arc::clone(h.value()))
    }

    /// Caches `drive` under `key`, returning the handle it replaced.
    pub fn insert(&self, key: HandleKey, drive: Arc<dyn Drive>) -> Option<Arc<dyn Drive>> {
        self.handles.insert(key, drive)
    }

    /// Removes the handle cached under exactly `key`.
    pub fn remove(&self, key: &HandleKey) -> Option<Arc<dyn Drive>> {
        self.handles.remove(key).map(|(_, d)| d)
    }

    /// Removes every handle of `dkey`, live and checkouts.
    pub fn evict(&self, dkey: &DiscoveryKey) -> Vec<Arc<dyn Drive>> {
        let keys: Vec<HandleKey> = self
            .handles
            .iter()
            .filter(|e| e.key().dkey == *dkey)
            .map(|e| *e.key())
            .collect();
        let evicted: Vec<_> = keys
            .iter()
            .filter_map(|k| self.handles.remove(k).map(|(_, d)| d))
            .collect();
        debug!(dkey = %dkey, evicted = evicted.len(), "evicted drive handles");
        evicted
    }

    /// Removes and returns every handle.
    pub fn drain(&self) -> Vec<Arc<dyn Drive>> {
        let keys: Vec<HandleKey> = self.handles.iter().map(|e| *e.key()).collect();
        keys.iter()
            .filter_map(|k| self.handles.remove(k).map(|(_, d)| d))
            .collect()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::LogDrive;
    use crate::keys::KeyPair;

    fn drive() -> Arc<dyn Drive> {
        Arc::new(LogDrive::new(KeyPair::generate(), None))
    }

    #[test]
    fn test_versions_are_distinct_entries() {
        let cache = HandleCache::new();
        let d = drive();
        let dkey = d.discovery_key();
        cache.insert(HandleKey::latest(dkey), Arc::clone(&d));
        cache.insert(HandleKey::at(dkey, 1), Arc::clone(&d));
        cache.insert(HandleKey::at(dkey, 11), d);
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&HandleKey::at(dkey, 1)).is_some());
        assert!(cache.get(&HandleKey::at(dkey, 2)).is_none());
    }

    #[test]
    fn test_evict_only_touches_one_module() {
        let cache = HandleCache::new();
        let a = drive();
        let b = drive();
        cache.insert(HandleKey::latest(a.discovery_key()), Arc::clone(&a));
        cache.insert(HandleKey::at(a.discovery_key(), 3), Arc::clone(&a));
        cache.insert(HandleKey::latest(b.discovery_key()), Arc::clone(&b));
        assert_eq!(cache.evict(&a.discovery_key()).len(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.drain().len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_single_checkout() {
        let cache = HandleCache::new();
        let d = drive();
        let dkey = d.discovery_key();
        cache.insert(HandleKey::latest(dkey), Arc::clone(&d));
        cache.insert(HandleKey::at(dkey, 2), d);
        assert!(cache.remove(&HandleKey::at(dkey, 2)).is_some());
        assert!(cache.remove(&HandleKey::at(dkey, 2)).is_none());
        assert!(cache.get(&HandleKey::latest(dkey)).is_some());
        assert_eq!(cache.len(), 1);
    }
}
