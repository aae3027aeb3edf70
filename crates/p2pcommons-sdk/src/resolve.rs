//! Resolving modules this peer may not hold: local index first, then the swarm.
//!
//! A fetch joins the module's topic, replicates and reads `index.json`,
//! retrying with a fixed delay. Cancellation is observed between and during
//! attempts and always wins before the local index is touched.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use p2pcommons_meta::cross::ModuleLookup;
use p2pcommons_meta::normalize::{record_from_value, unflatten};
use p2pcommons_meta::types::INDEX_JSON;
use p2pcommons_meta::validate::{validate_nested, ValidationContext};
use p2pcommons_meta::{
    HyperKey, JoinOptions, MissingParam, ModuleRecord, StorageEnvelope, TypeError, VersionedKey,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drive::Drive;
use crate::engine::{Engine, ModuleView};
use crate::error::{Result, SdkError};
use crate::events::EngineEvent;
use crate::swarm::SwarmNetworker;

const FETCH_CONTEXT: &str = "clone: Problems fetching external module";

/// A record read from a drive, with its provenance.
struct Fetched {
    record: ModuleRecord,
    modified: DateTime<Utc>,
    version: u64,
}

impl Engine {
    /// Returns a module, fetching it from the swarm if it is not local.
    ///
    /// A versioned url returns exactly that snapshot. Unversioned fetches
    /// are cached in the local index and seeded; with `download` the drive
    /// files are written to the module directory (`<hex>+<version>` for
    /// snapshots).
    pub async fn clone_module(&self, url: &str, download: bool) -> Result<ModuleView> {
        self.clone_with_cancel(url, download, &CancellationToken::new())
            .await
    }

    /// [`Engine::clone_module`] that stops with [`SdkError::Cancelled`] once
    /// `cancel` fires. A cancelled clone leaves the local index untouched.
    pub async fn clone_with_cancel(
        &self,
        url: &str,
        download: bool,
        cancel: &CancellationToken,
    ) -> Result<ModuleView> {
        let reference = self.parse_url(url)?;
        self.resolve(reference, download, cancel).await
    }

    pub(crate) async fn resolve(
        &self,
        reference: VersionedKey,
        download: bool,
        cancel: &CancellationToken,
    ) -> Result<ModuleView> {
        if cancel.is_cancelled() {
            return Err(SdkError::Cancelled);
        }
        let key = reference.key;
        let local = self.index.get(&key)?;
        if let Some(envelope) = &local {
            match reference.version {
                None => return Ok(envelope.clone().into()),
                Some(v) if v == envelope.version => return Ok(envelope.clone().into()),
                Some(v) => match self.read_snapshot(&key, v).await {
                    Ok(fetched) => {
                        return Ok(ModuleView::new(
                            fetched.record,
                            envelope.is_writable,
                            fetched.modified,
                            fetched.version,
                        ))
                    }
                    Err(e) if envelope.is_writable => {
                        debug!(key = %key, version = v, error = %e, "no such local snapshot");
                        return Err(SdkError::not_found(reference));
                    }
                    Err(e) => debug!(key = %key, version = v, error = %e, "snapshot not local"),
                },
            }
        }

        let drive = self.drive_for(&key).await?;
        let swarm = self.swarm().cloned();
        if let Some(swarm) = &swarm {
            let options = JoinOptions {
                announce: false,
                lookup: true,
            };
            swarm.join(Arc::clone(&drive), options).await?;
        }
        let fetched = match self
            .fetch_with_retries(&drive, swarm.as_deref(), reference.version, cancel)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                if local.is_none() {
                    self.forget(&key, swarm.as_deref()).await;
                }
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            return Err(SdkError::Cancelled);
        }

        let Some(version) = reference.version else {
            return self.store_latest(drive, fetched, download).await;
        };
        if download {
            let dir = self
                .config
                .base_dir
                .join(format!("{}+{}", key.to_hex(), version));
            let snapshot = self.checkout(&key, version).await?;
            let written = self.drives.download_files(snapshot.as_ref(), &dir).await;
            self.release_checkout(&key, version);
            written?;
        }
        info!(key = %key, version, "fetched module snapshot");
        Ok(ModuleView::new(
            fetched.record,
            drive.writable(),
            fetched.modified,
            fetched.version,
        ))
    }

    async fn fetch_with_retries(
        &self,
        drive: &Arc<dyn Drive>,
        swarm: Option<&dyn SwarmNetworker>,
        version: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Fetched> {
        let key = drive.key();
        let attempts = if swarm.is_some() {
            self.config.retries()
        } else {
            1
        };
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(SdkError::Cancelled),
                outcome = self.fetch_once(drive, swarm, version) => outcome,
            };
            match outcome {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    warn!(key = %key, attempt, attempts, error = %e, "fetch attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SdkError::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay()) => {}
                }
            }
        }
        Err(SdkError::Fetch {
            context: FETCH_CONTEXT.into(),
            message: last_error,
        })
    }

    async fn fetch_once(
        &self,
        drive: &Arc<dyn Drive>,
        swarm: Option<&dyn SwarmNetworker>,
        version: Option<u64>,
    ) -> Result<Fetched> {
        if let Some(swarm) = swarm {
            let added = swarm.replicate(drive.as_ref()).await?;
            debug!(key = %drive.key(), added, "replicated");
        }
        match version {
            Some(v) => self.read_snapshot(&drive.key(), v).await,
            None => read_drive(drive.as_ref()).await,
        }
    }

    async fn read_snapshot(&self, key: &HyperKey, version: u64) -> Result<Fetched> {
        let snapshot = self.checkout(key, version).await?;
        let fetched = read_drive(snapshot.as_ref()).await;
        self.release_checkout(key, version);
        fetched
    }

    /// Caches a fetched latest record, unless a newer copy is already indexed.
    async fn store_latest(
        &self,
        drive: Arc<dyn Drive>,
        fetched: Fetched,
        download: bool,
    ) -> Result<ModuleView> {
        let key = drive.key();
        if let Some(existing) = self.index.get(&key)? {
            if existing.last_modified >= fetched.modified {
                debug!(key = %key, "indexed copy is not older, keeping it");
                return Ok(existing.into());
            }
        }
        let envelope = StorageEnvelope {
            is_writable: drive.writable(),
            last_modified: fetched.modified,
            version: fetched.version,
            module_type: fetched.record.module_type(),
            raw_json: fetched.record,
        };
        self.index.put(&envelope)?;
        self.index.put_seed(&key, JoinOptions::default())?;
        if let Some(swarm) = self.swarm() {
            swarm.join(Arc::clone(&drive), JoinOptions::default()).await?;
        }
        if download {
            let files = self
                .drives
                .download_files(drive.as_ref(), &self.module_dir(&key))
                .await?;
            debug!(key = %key, files, "downloaded module files");
        }
        info!(key = %key, version = envelope.version, "cloned module");
        self.events.publish(EngineEvent::ModuleCloned {
            key: key.to_hex(),
            version: envelope.version,
        });
        Ok(envelope.into())
    }

    /// Drops the handles and topic of a module that could not be fetched.
    async fn forget(&self, key: &HyperKey, swarm: Option<&dyn SwarmNetworker>) {
        let dkey = key.discovery_key();
        if let Some(swarm) = swarm {
            if let Err(e) = swarm.leave(&dkey).await {
                debug!(key = %key, error = %e, "leaving topic failed");
            }
        }
        for handle in self.handles.evict(&dkey) {
            if let Err(e) = handle.close().await {
                debug!(key = %key, error = %e, "closing handle failed");
            }
        }
    }

    /// Checks that every author of a content snapshot registered it.
    ///
    /// Returns false when the content lists no authors or an author's
    /// profile does not carry exactly `<key>+<version>` in `contents`.
    pub async fn verify(&self, url: &str) -> Result<bool> {
        let reference = self.parse_url(url)?;
        if reference.version.is_none() {
            return Err(MissingParam {
                param: "version".into(),
            }
            .into());
        }
        let content = self
            .lookup(&reference)
            .await?
            .ok_or_else(|| SdkError::not_found(reference))?;
        let Some(fields) = content.as_content() else {
            return Err(TypeError::new("content", content.module_type().as_str(), "type").into());
        };
        if fields.authors.is_empty() {
            return Ok(false);
        }
        let entry = reference.to_string();
        for author in &fields.authors {
            let Some(author_key) = HyperKey::from_hex(author) else {
                return Ok(false);
            };
            let profile = self.lookup(&VersionedKey::latest(author_key)).await?;
            let registered = profile
                .as_ref()
                .and_then(ModuleRecord::as_profile)
                .is_some_and(|p| p.contents.contains(&entry));
            if !registered {
                debug!(content = %entry, author = %author, "author has not registered content");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ModuleLookup for Engine {
    type Error = SdkError;

    async fn lookup(&self, key: &VersionedKey) -> Result<Option<ModuleRecord>> {
        let cancel = CancellationToken::new();
        match self.resolve(*key, false, &cancel).await {
            Ok(view) => Ok(Some(ModuleRecord::try_from(view.raw_json)?)),
            Err(SdkError::Fetch { .. }) | Err(SdkError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Reads and validates `index.json` through `drive`.
async fn read_drive(drive: &dyn Drive) -> Result<Fetched> {
    let key = drive.key();
    let version = drive.version().await;
    let raw = drive.read_file(INDEX_JSON).await?;
    let value: Value = serde_json::from_slice(&raw)?;
    let nested = unflatten(&value);
    // parents may name any snapshot older than the one being read
    validate_nested(&nested, &ValidationContext::new(key).with_version(version))?;
    let record = record_from_value(&nested)?;
    let modified = drive
        .stat(INDEX_JSON)
        .await?
        .map(|s| s.mtime)
        .unwrap_or_default();
    Ok(Fetched {
        record,
        modified,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> Engine {
        let mut config = EngineConfig::new(dir.path());
        config.persist = false;
        Engine::open(config).await.unwrap()
    }

    /// Latest record of a fresh content module, as a fetch would return it.
    async fn fetched(engine: &Engine) -> (HyperKey, Arc<dyn Drive>, Fetched) {
        let view = engine
            .init(json!({"type": "content", "title": "Paper"}))
            .await
            .unwrap();
        let key = view.key().unwrap();
        let drive = engine.drive_for(&key).await.unwrap();
        let fetched = read_drive(drive.as_ref()).await.unwrap();
        (key, drive, fetched)
    }

    #[tokio::test]
    async fn test_store_latest_keeps_newer_indexed_copy() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let (key, drive, fetched) = fetched(&engine).await;
        let fetched_at = fetched.modified;

        let mut newer = engine.index.get(&key).unwrap().unwrap();
        newer.raw_json.title = "Local edit".into();
        newer.last_modified = fetched_at + Duration::hours(1);
        engine.index.put(&newer).unwrap();
        let mut events = engine.subscribe();

        let kept = engine.store_latest(drive, fetched, false).await.unwrap();
        assert_eq!(kept.raw_json.title, "Local edit");
        let stored = engine.index.get(&key).unwrap().unwrap();
        assert_eq!(stored.raw_json.title, "Local edit");
        assert!(stored.last_modified > fetched_at);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_latest_replaces_older_indexed_copy() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let (key, drive, fetched) = fetched(&engine).await;
        let version = fetched.version;

        let mut stale = engine.index.get(&key).unwrap().unwrap();
        stale.raw_json.title = "Stale".into();
        stale.last_modified = fetched.modified - Duration::hours(1);
        engine.index.put(&stale).unwrap();
        let mut events = engine.subscribe();

        let stored = engine.store_latest(drive, fetched, false).await.unwrap();
        assert_eq!(stored.raw_json.title, "Paper");
        assert_eq!(engine.index.get(&key).unwrap().unwrap().raw_json.title, "Paper");
        assert_eq!(
            events.try_recv().unwrap(),
            EngineEvent::ModuleCloned {
                key: key.to_hex(),
                version
            }
        );
    }

    #[tokio::test]
    async fn test_snapshot_reads_release_checkouts() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let view = engine
            .init(json!({"type": "content", "title": "First"}))
            .await
            .unwrap();
        let first = view.versioned_key().unwrap();
        engine
            .set(&first, json!({"title": "Second"}), false)
            .await
            .unwrap();
        let cached = engine.handles.len();

        for _ in 0..3 {
            let snapshot = engine.clone_module(&first, false).await.unwrap();
            assert_eq!(snapshot.raw_json.title, "First");
            assert!(!engine.verify(&first).await.unwrap());
        }
        assert_eq!(engine.handles.len(), cached);
    }
}
