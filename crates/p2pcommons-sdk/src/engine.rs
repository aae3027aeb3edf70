//! The module engine.
//!
//! Ties the validators, the codec-backed local index, drives and the swarm
//! together. Every mutating operation follows the same shape: resolve and
//! validate everything first, then write the module directory, the drive
//! and the index. A validation failure never leaves anything on disk.
//!
//! Operations live in three files: lifecycle and reads here, updates in
//! [`crate::mutate`], swarm resolution and verification in
//! [`crate::resolve`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use p2pcommons_meta::codec;
use p2pcommons_meta::normalize::{record_from_value, unflatten};
use p2pcommons_meta::types::INDEX_JSON;
use p2pcommons_meta::url;
use p2pcommons_meta::validate::{validate_nested, ValidationContext};
use p2pcommons_meta::{
    EBusyError, FlatRecord, HyperKey, IndexField, InvalidKeyError, JoinOptions, KvStore, Links,
    LocalIndex, MemoryKvStore, MetaError, MissingParam, ModuleKind, ModuleRecord, ModuleType,
    SledKvStore, StorageEnvelope, TypeError, ValidationCode, ValidationError, VersionedKey,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{HandleCache, HandleKey};
use crate::config::{EngineConfig, Settings};
use crate::drive::{Drive, DriveStore, LogDriveStore};
use crate::error::{Result, SdkError};
use crate::events::{EngineEvent, EventBus};
use crate::keys::KeyPair;
use crate::swarm::SwarmNetworker;

/// Fields accepted by [`Engine::init`].
const INIT_FIELDS: [&str; 10] = [
    "type",
    "title",
    "description",
    "subtype",
    "main",
    "avatar",
    "authors",
    "parents",
    "follows",
    "contents",
];

/// Directory of deleted module files, inside the base directory.
pub const TRASH_DIR: &str = ".trash";

/// Directory of drive logs, inside the base directory.
pub const DRIVES_DIR: &str = ".drives";

/// Directory of the sled index, inside the base directory.
pub const DB_DIR: &str = "db";

/// A module as handed to callers: flattened metadata plus bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleView {
    /// Flattened module metadata.
    pub raw_json: FlatRecord,
    /// True iff this peer holds the module's secret key.
    pub is_writable: bool,
    /// Last modification time.
    pub last_modified: DateTime<Utc>,
    /// Drive version the metadata was read at.
    pub version: u64,
}

impl ModuleView {
    pub(crate) fn new(
        record: ModuleRecord,
        is_writable: bool,
        last_modified: DateTime<Utc>,
        version: u64,
    ) -> Self {
        Self {
            raw_json: FlatRecord::from(record),
            is_writable,
            last_modified,
            version,
        }
    }

    /// Module key, if the url is well formed.
    pub fn key(&self) -> Option<HyperKey> {
        url::parse_key(&self.raw_json.url).map(|k| k.key)
    }

    /// `<hex>+<version>` reference to exactly this snapshot.
    pub fn versioned_key(&self) -> Option<String> {
        self.key().map(|k| k.at(self.version).to_string())
    }
}

impl From<StorageEnvelope> for ModuleView {
    fn from(envelope: StorageEnvelope) -> Self {
        ModuleView::new(
            envelope.raw_json,
            envelope.is_writable,
            envelope.last_modified,
            envelope.version,
        )
    }
}

/// Local-first module store with swarm fallback.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) settings: RwLock<Settings>,
    pub(crate) index: LocalIndex,
    pub(crate) drives: Arc<dyn DriveStore>,
    pub(crate) swarm: Option<Arc<dyn SwarmNetworker>>,
    pub(crate) handles: HandleCache,
    pub(crate) events: EventBus,
}

impl Engine {
    /// Opens an engine without a swarm.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_swarm(config, None).await
    }

    /// Opens an engine using the default index and drive store for `config`.
    pub async fn open_with_swarm(
        config: EngineConfig,
        swarm: Option<Arc<dyn SwarmNetworker>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.base_dir)?;
        let settings = Settings::load_or_create(&config.base_dir)?;
        let (kv, drives): (Arc<dyn KvStore>, Arc<dyn DriveStore>) = if config.persist {
            let kv = SledKvStore::open(config.base_dir.join(DB_DIR))?;
            let drives = LogDriveStore::persistent(
                settings.keys_dir(&config.base_dir),
                config.base_dir.join(DRIVES_DIR),
            )?;
            (Arc::new(kv), Arc::new(drives))
        } else {
            (Arc::new(MemoryKvStore::new()), Arc::new(LogDriveStore::in_memory()))
        };
        Self::open_with(config, settings, kv, drives, swarm).await
    }

    /// Opens an engine over explicit collaborators.
    ///
    /// Seeded modules are re-opened and re-joined before this returns; any
    /// failure aborts the open.
    pub async fn open_with(
        config: EngineConfig,
        settings: Settings,
        kv: Arc<dyn KvStore>,
        drives: Arc<dyn DriveStore>,
        swarm: Option<Arc<dyn SwarmNetworker>>,
    ) -> Result<Self> {
        let events = EventBus::new(config.event_capacity);
        let engine = Self {
            config,
            settings: RwLock::new(settings),
            index: LocalIndex::new(kv),
            drives,
            swarm,
            handles: HandleCache::new(),
            events,
        };
        let seeds = engine.index.seeds()?;
        for seed in &seeds {
            let Some(key) = HyperKey::from_hex(&seed.key) else {
                warn!(key = %seed.key, "skipping malformed seed entry");
                continue;
            };
            let drive = engine.drive_for(&key).await?;
            if let Some(swarm) = engine.swarm() {
                swarm.join(drive, seed.options).await?;
            }
        }
        info!(
            base_dir = %engine.config.base_dir.display(),
            seeds = seeds.len(),
            swarm = engine.swarm().is_some(),
            "engine ready"
        );
        Ok(engine)
    }

    /// The active swarm, unless disabled.
    pub(crate) fn swarm(&self) -> Option<&Arc<dyn SwarmNetworker>> {
        if self.config.disable_swarm {
            None
        } else {
            self.swarm.as_ref()
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A copy of the current settings.
    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Directory holding the files of module `key`.
    pub fn module_dir(&self, key: &HyperKey) -> PathBuf {
        self.config.base_dir.join(key.to_hex())
    }

    pub(crate) fn parse_url(&self, input: &str) -> Result<VersionedKey> {
        url::parse_key(input).ok_or_else(|| TypeError::new("module url", input, "url").into())
    }

    pub(crate) fn envelope(&self, key: &HyperKey) -> Result<StorageEnvelope> {
        self.index.get(key)?.ok_or_else(|| SdkError::not_found(key))
    }

    pub(crate) fn writable_envelope(&self, key: &HyperKey) -> Result<StorageEnvelope> {
        let envelope = self.envelope(key)?;
        if !envelope.is_writable {
            return Err(SdkError::not_writable(key));
        }
        Ok(envelope)
    }

    /// Live drive handle for `key`, opening and caching it on first use.
    pub(crate) async fn drive_for(&self, key: &HyperKey) -> Result<Arc<dyn Drive>> {
        let handle_key = HandleKey::latest(key.discovery_key());
        if let Some(drive) = self.handles.get(&handle_key) {
            return Ok(drive);
        }
        let drive = self.drives.open(key).await?;
        self.handles.insert(handle_key, Arc::clone(&drive));
        Ok(drive)
    }

    /// Read-only checkout of `key` at `version`, cached per version.
    pub(crate) async fn checkout(&self, key: &HyperKey, version: u64) -> Result<Arc<dyn Drive>> {
        let handle_key = HandleKey::at(key.discovery_key(), version);
        if let Some(drive) = self.handles.get(&handle_key) {
            return Ok(drive);
        }
        let snapshot = self.drive_for(key).await?.checkout(version).await?;
        self.handles.insert(handle_key, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Evicts a cached checkout once its reader is done with it. The handle
    /// is not closed; concurrent readers may still hold it.
    pub(crate) fn release_checkout(&self, key: &HyperKey, version: u64) {
        if self
            .handles
            .remove(&HandleKey::at(key.discovery_key(), version))
            .is_some()
        {
            debug!(key = %key, version, "released checkout");
        }
    }

    pub(crate) fn warn_busy(&self, key: &HyperKey, busy: &[String]) {
        for path in busy {
            warn!(key = %key, path = %path, "file busy, not imported");
            self.events.publish(EngineEvent::Warning(EBusyError {
                message: format!("{} is busy", path),
                key: key.to_hex(),
            }));
        }
    }

    /// Writes `record` to the module directory and drive, then indexes it.
    pub(crate) async fn persist(
        &self,
        drive: &dyn Drive,
        record: &ModuleRecord,
    ) -> Result<StorageEnvelope> {
        codec::check_record(record).map_err(MetaError::from)?;
        let key = drive.key();
        let dir = self.module_dir(&key);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(&FlatRecord::from(record.clone()))?;
        tokio::fs::write(dir.join(INDEX_JSON), &json).await?;

        let report = self.drives.import_files(drive, &dir, &[INDEX_JSON]).await?;
        self.warn_busy(&key, &report.busy);
        let version = drive.write_file(INDEX_JSON, json).await?;

        let envelope = StorageEnvelope::new(record.clone(), drive.writable(), version);
        self.index.put(&envelope)?;
        debug!(key = %key, version, imported = report.imported.len(), "persisted module");
        Ok(envelope)
    }

    /// Creates a module.
    ///
    /// `params` is a flat object with a required `type` and any of the
    /// settable fields; `title` is required. The first profile created on
    /// this peer becomes the default profile.
    pub async fn init(&self, params: Value) -> Result<ModuleView> {
        let Value::Object(fields) = params else {
            return Err(TypeError::new("object", kind_of(&params), "params").into());
        };
        let module_type = match fields.get("type") {
            None => {
                return Err(MissingParam {
                    param: "type".into(),
                }
                .into())
            }
            Some(Value::String(t)) => t.parse::<ModuleType>().map_err(|()| {
                ValidationError::new(
                    format!("Unknown module type '{}'", t),
                    ValidationCode::TypeValue,
                    "type",
                )
            })?,
            Some(_) => {
                return Err(ValidationError::new(
                    "Type must be a string",
                    ValidationCode::TypeType,
                    "type",
                )
                .into())
            }
        };
        if let Some(invalid) = fields.keys().find(|k| !INIT_FIELDS.contains(&k.as_str())) {
            return Err(InvalidKeyError {
                invalid: invalid.clone(),
            }
            .into());
        }

        let pair = KeyPair::generate();
        let key = pair.public();
        let defaults = FlatRecord::from(ModuleRecord {
            title: String::new(),
            description: String::new(),
            url: key.to_url(),
            links: Links::default(),
            p2pcommons: ModuleKind::empty(module_type),
        });
        let mut flat = serde_json::to_value(defaults)?;
        if let Value::Object(map) = &mut flat {
            map.remove("title");
            map.extend(fields);
        }
        let nested = unflatten(&flat);
        validate_nested(&nested, &ValidationContext::new(key))?;
        let record = record_from_value(&nested)?;

        let drive = self.drives.create(pair).await?;
        self.handles
            .insert(HandleKey::latest(key.discovery_key()), Arc::clone(&drive));
        let envelope = self.persist(drive.as_ref(), &record).await?;
        self.index.put_seed(&key, JoinOptions::default())?;
        if let Some(swarm) = self.swarm() {
            swarm.join(Arc::clone(&drive), JoinOptions::default()).await?;
        }

        if module_type == ModuleType::Profile {
            let mut settings = self.settings.write().await;
            if settings.default_profile.is_empty() {
                settings.default_profile = key.to_hex();
                settings.save(&self.config.base_dir)?;
            }
        }
        info!(key = %key, module_type = %module_type, "module created");
        self.events.publish(EngineEvent::ModuleCreated {
            key: key.to_hex(),
            module_type,
        });
        Ok(envelope.into())
    }

    /// Returns the latest local state of a module.
    ///
    /// A version suffix in `url` is ignored; use
    /// [`Engine::clone_module`] to read a specific snapshot.
    pub async fn get(&self, url: &str) -> Result<ModuleView> {
        let key = self.parse_url(url)?.key;
        Ok(self.envelope(&key)?.into())
    }

    /// Every module in the local index.
    pub async fn list(&self) -> Result<Vec<ModuleView>> {
        Ok(self.index.list()?.into_iter().map(Into::into).collect())
    }

    /// Local content modules.
    pub async fn list_content(&self) -> Result<Vec<ModuleView>> {
        self.list_type(ModuleType::Content)
    }

    /// Local profile modules.
    pub async fn list_profiles(&self) -> Result<Vec<ModuleView>> {
        self.list_type(ModuleType::Profile)
    }

    fn list_type(&self, module_type: ModuleType) -> Result<Vec<ModuleView>> {
        Ok(self
            .index
            .list()?
            .into_iter()
            .filter(|e| e.module_type == module_type)
            .map(Into::into)
            .collect())
    }

    /// Modules whose `field` contains `query`, ignoring case.
    pub async fn filter(&self, field: IndexField, query: &str) -> Result<Vec<ModuleView>> {
        Ok(self
            .index
            .filter(field, query)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Hex key of the default profile.
    pub async fn default_profile(&self) -> Option<String> {
        let settings = self.settings.read().await;
        (!settings.default_profile.is_empty()).then(|| settings.default_profile.clone())
    }

    /// Makes the local profile at `url` the default one.
    pub async fn set_default_profile(&self, url: &str) -> Result<()> {
        let key = self.parse_url(url)?.key;
        let envelope = self.writable_envelope(&key)?;
        if envelope.module_type != ModuleType::Profile {
            return Err(TypeError::new("profile", envelope.module_type.as_str(), "type").into());
        }
        let mut settings = self.settings.write().await;
        settings.default_profile = key.to_hex();
        settings.save(&self.config.base_dir)?;
        Ok(())
    }

    /// Removes a local module.
    ///
    /// Content is first deregistered from every local profile. With
    /// `delete_files` the module directory moves to `<base_dir>/.trash` and
    /// the drive log and secret key are deleted.
    pub async fn delete(&self, url: &str, delete_files: bool) -> Result<()> {
        let key = self.parse_url(url)?.key;
        let envelope = self.writable_envelope(&key)?;
        if envelope.module_type == ModuleType::Content {
            self.deregister_everywhere(&key).await?;
        }

        self.index.delete(&key)?;
        self.index.delete_seed(&key)?;
        let dkey = key.discovery_key();
        if let Some(swarm) = self.swarm() {
            swarm.leave(&dkey).await?;
        }
        for handle in self.handles.evict(&dkey) {
            handle.close().await?;
        }

        if delete_files {
            self.move_to_trash(&key).await?;
            self.drives.remove(&key).await?;
        }

        let mut settings = self.settings.write().await;
        if settings.default_profile == key.to_hex() {
            settings.default_profile.clear();
            settings.save(&self.config.base_dir)?;
        }
        drop(settings);

        info!(key = %key, delete_files, "module deleted");
        self.events.publish(EngineEvent::ModuleDeleted { key: key.to_hex() });
        Ok(())
    }

    async fn move_to_trash(&self, key: &HyperKey) -> Result<()> {
        let dir = self.module_dir(key);
        if !dir.exists() {
            return Ok(());
        }
        let trash = self.config.base_dir.join(TRASH_DIR);
        tokio::fs::create_dir_all(&trash).await?;
        let target = trash.join(key.to_hex());
        if target.exists() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&dir, &target).await?;
        debug!(key = %key, target = %target.display(), "moved module files to trash");
        Ok(())
    }

    /// Re-reads a local module's directory.
    ///
    /// Changed files are imported into the drive and an edited `index.json`
    /// is validated and persisted. Busy files are reported as
    /// [`EngineEvent::Warning`] and skipped.
    pub async fn refresh(&self, url: &str) -> Result<ModuleView> {
        let key = self.parse_url(url)?.key;
        let envelope = self.writable_envelope(&key)?;
        let dir = self.module_dir(&key);
        let record = read_module_file(&dir, &key, envelope.version).await?;

        let drive = self.drive_for(&key).await?;
        let report = self.drives.import_files(drive.as_ref(), &dir, &[INDEX_JSON]).await?;
        self.warn_busy(&key, &report.busy);
        if record == envelope.raw_json && report.imported.is_empty() {
            return Ok(envelope.into());
        }

        let updated = self.persist(drive.as_ref(), &record).await?;
        self.events.publish(EngineEvent::ModuleUpdated {
            key: key.to_hex(),
            version: updated.version,
        });
        Ok(updated.into())
    }

    /// Leaves the swarm, closes every drive handle and flushes the index.
    pub async fn close(&self) -> Result<()> {
        let handles = self.handles.drain();
        for handle in &handles {
            if let Some(swarm) = self.swarm() {
                swarm.leave(&handle.discovery_key()).await?;
            }
            handle.close().await?;
        }
        if let Some(swarm) = self.swarm() {
            swarm.close().await?;
        }
        self.index.flush()?;
        info!(handles = handles.len(), "engine closed");
        Ok(())
    }
}

/// Reads and validates `<dir>/index.json`, accepting either shape.
async fn read_module_file(dir: &Path, key: &HyperKey, version: u64) -> Result<ModuleRecord> {
    let raw = tokio::fs::read(dir.join(INDEX_JSON)).await?;
    let value: Value = serde_json::from_slice(&raw)?;
    let nested = unflatten(&value);
    let ctx = ValidationContext::new(*key)
        .with_version(version)
        .with_module_dir(dir);
    validate_nested(&nested, &ctx)?;
    Ok(record_from_value(&nested)?)
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
