//! Versioned module drives.
//!
//! A drive is an append-only log of file writes owned by one key pair. The
//! drive version is the log length, so every write bumps it by one and a
//! checkout of version `v` is the drive as it was after its first `v`
//! entries. Entries are signed by the drive's secret key; replicas verify
//! them against the module key before appending.
//!
//! `LogDrive` optionally mirrors its log to a file of length-prefixed
//! bincode frames so a drive survives restarts.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use p2pcommons_meta::types::{from_millis, now_millis};
use p2pcommons_meta::{DiscoveryKey, HyperKey};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::DriveError;
use crate::keys::{self, KeyPair};

/// Linux `EBUSY`.
const EBUSY: i32 = 16;

/// One appended file write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Drive-relative path.
    pub path: String,
    /// Full file contents.
    pub data: Vec<u8>,
    /// Write time in milliseconds since the epoch.
    pub mtime_ms: i64,
    /// Signature by the drive's secret key.
    pub signature: Vec<u8>,
}

impl LogEntry {
    fn signable(seq: u64, path: &str, data: &[u8], mtime_ms: i64) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&seq.to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(&mtime_ms.to_le_bytes());
        hasher.update(blake3::hash(data).as_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Metadata of a file in a drive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Size in bytes.
    pub size: u64,
    /// Time of the write that produced this content.
    pub mtime: DateTime<Utc>,
    /// Drive version right after that write.
    pub version: u64,
}

/// Outcome of importing a directory into a drive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Files whose content changed and were appended.
    pub imported: Vec<String>,
    /// Files that could not be read because they were busy.
    pub busy: Vec<String>,
}

/// A versioned file store backing one module.
#[async_trait]
pub trait Drive: Send + Sync {
    /// Module key of this drive.
    fn key(&self) -> HyperKey;

    /// Discovery key announced for this drive.
    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// True if this handle may append.
    fn writable(&self) -> bool;

    /// Current version (number of log entries visible through this handle).
    async fn version(&self) -> u64;

    /// Reads the latest content of `path`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DriveError>;

    /// Appends a write of `path` and returns the new version.
    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<u64, DriveError>;

    /// Returns metadata for `path`, `None` if absent.
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, DriveError>;

    /// Lists every file path, sorted.
    async fn readdir(&self) -> Result<Vec<String>, DriveError>;

    /// Returns a read-only view of the drive at `version`.
    async fn checkout(&self, version: u64) -> Result<Arc<dyn Drive>, DriveError>;

    /// Returns log entries from sequence `from` onwards.
    async fn export_log(&self, from: u64) -> Result<Vec<LogEntry>, DriveError>;

    /// Appends replicated entries starting at sequence `from`; returns the
    /// number of new entries.
    async fn import_log(&self, from: u64, entries: Vec<LogEntry>) -> Result<u64, DriveError>;

    /// Closes the handle. Further calls fail with [`DriveError::Closed`].
    async fn close(&self) -> Result<(), DriveError>;
}

/// Append-only log drive.
pub struct LogDrive {
    key: HyperKey,
    signer: Option<KeyPair>,
    log: Arc<RwLock<Vec<LogEntry>>>,
    pinned: Option<u64>,
    file: Option<PathBuf>,
    closed: AtomicBool,
}

impl LogDrive {
    /// Creates an empty writable drive.
    pub fn new(pair: KeyPair, file: Option<PathBuf>) -> Self {
        Self {
            key: pair.public(),
            signer: Some(pair),
            log: Arc::new(RwLock::new(Vec::new())),
            pinned: None,
            file,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates an empty read-only replica of `key`.
    pub fn replica(key: HyperKey, file: Option<PathBuf>) -> Self {
        Self {
            key,
            signer: None,
            log: Arc::new(RwLock::new(Vec::new())),
            pinned: None,
            file,
            closed: AtomicBool::new(false),
        }
    }

    /// Loads a drive from its log file, verifying every entry.
    pub async fn load(
        key: HyperKey,
        signer: Option<KeyPair>,
        file: PathBuf,
    ) -> Result<Self, DriveError> {
        let bytes = tokio::fs::read(&file).await?;
        let mut entries = Vec::new();
        let mut rest = bytes.as_slice();
        while rest.len() >= 4 {
            let mut len = [0u8; 4];
            len.copy_from_slice(&rest[..4]);
            let len = u32::from_le_bytes(len) as usize;
            if rest.len() < 4 + len {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&rest[4..4 + len])?;
            verify_entry(&key, entries.len() as u64, &entry)?;
            entries.push(entry);
            rest = &rest[4 + len..];
        }
        if !rest.is_empty() {
            // torn final frame from an interrupted append
            let valid = (bytes.len() - rest.len()) as u64;
            debug!(key = %key, trailing = rest.len(), "truncating partial log frame");
            tokio::fs::OpenOptions::new()
                .write(true)
                .open(&file)
                .await?
                .set_len(valid)
                .await?;
        }
        debug!(key = %key, entries = entries.len(), "loaded drive log");
        Ok(Self {
            key,
            signer,
            log: Arc::new(RwLock::new(entries)),
            pinned: None,
            file: Some(file),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), DriveError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriveError::Closed);
        }
        Ok(())
    }

    fn visible<'a>(&self, log: &'a [LogEntry]) -> &'a [LogEntry] {
        match self.pinned {
            Some(v) => &log[..(v as usize).min(log.len())],
            None => log,
        }
    }

    async fn append_to_file(&self, entries: &[LogEntry]) -> Result<(), DriveError> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let mut buf = Vec::new();
        for entry in entries {
            let frame = bincode::serialize(entry)?;
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(&frame);
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

fn verify_entry(key: &HyperKey, seq: u64, entry: &LogEntry) -> Result<(), DriveError> {
    let message = LogEntry::signable(seq, &entry.path, &entry.data, entry.mtime_ms);
    if keys::verify(key, &message, &entry.signature) {
        Ok(())
    } else {
        Err(DriveError::InvalidSignature { seq })
    }
}

#[async_trait]
impl Drive for LogDrive {
    fn key(&self) -> HyperKey {
        self.key
    }

    fn writable(&self) -> bool {
        self.signer.is_some() && self.pinned.is_none()
    }

    async fn version(&self) -> u64 {
        let log = self.log.read().await;
        self.visible(&log).len() as u64
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DriveError> {
        self.ensure_open()?;
        let log = self.log.read().await;
        self.visible(&log)
            .iter()
            .rev()
            .find(|e| e.path == path)
            .map(|e| e.data.clone())
            .ok_or_else(|| DriveError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<u64, DriveError> {
        self.ensure_open()?;
        let signer = match (&self.signer, self.pinned) {
            (Some(signer), None) => signer,
            _ => return Err(DriveError::NotWritable(self.key.to_hex())),
        };
        let mut log = self.log.write().await;
        let seq = log.len() as u64;
        let mtime_ms = now_millis().timestamp_millis();
        let signature = signer.sign(&LogEntry::signable(seq, path, &data, mtime_ms));
        let entry = LogEntry {
            path: path.to_string(),
            data,
            mtime_ms,
            signature,
        };
        self.append_to_file(std::slice::from_ref(&entry)).await?;
        log.push(entry);
        debug!(key = %self.key, path, version = seq + 1, "drive write");
        Ok(seq + 1)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>, DriveError> {
        self.ensure_open()?;
        let log = self.log.read().await;
        let visible = self.visible(&log);
        Ok(visible
            .iter()
            .enumerate()
            .rev()
            .find(|(_, e)| e.path == path)
            .map(|(seq, e)| FileStat {
                size: e.data.len() as u64,
                mtime: from_millis(e.mtime_ms),
                version: seq as u64 + 1,
            }))
    }

    async fn readdir(&self) -> Result<Vec<String>, DriveError> {
        self.ensure_open()?;
        let log = self.log.read().await;
        let mut paths: Vec<String> = self.visible(&log).iter().map(|e| e.path.clone()).collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    async fn checkout(&self, version: u64) -> Result<Arc<dyn Drive>, DriveError> {
        self.ensure_open()?;
        let current = self.version().await;
        if version > current {
            return Err(DriveError::VersionNotFound {
                requested: version,
                current,
            });
        }
        Ok(Arc::new(LogDrive {
            key: self.key,
            signer: None,
            log: Arc::clone(&self.log),
            pinned: Some(version),
            file: None,
            closed: AtomicBool::new(false),
        }))
    }

    async fn export_log(&self, from: u64) -> Result<Vec<LogEntry>, DriveError> {
        self.ensure_open()?;
        let log = self.log.read().await;
        let visible = self.visible(&log);
        Ok(visible
            .get(from as usize..)
            .map(<[LogEntry]>::to_vec)
            .unwrap_or_default())
    }

    async fn import_log(&self, from: u64, entries: Vec<LogEntry>) -> Result<u64, DriveError> {
        self.ensure_open()?;
        if self.pinned.is_some() {
            return Err(DriveError::NotWritable(self.key.to_hex()));
        }
        let mut log = self.log.write().await;
        let local = log.len() as u64;
        if from > local {
            return Err(DriveError::LogGap { local, from });
        }
        let skip = (local - from) as usize;
        let fresh: Vec<LogEntry> = entries.into_iter().skip(skip).collect();
        for (i, entry) in fresh.iter().enumerate() {
            verify_entry(&self.key, local + i as u64, entry)?;
        }
        self.append_to_file(&fresh).await?;
        let added = fresh.len() as u64;
        log.extend(fresh);
        if added > 0 {
            debug!(key = %self.key, added, version = local + added, "replicated log entries");
        }
        Ok(added)
    }

    async fn close(&self) -> Result<(), DriveError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Creates and opens drives, and moves files between drives and directories.
#[async_trait]
pub trait DriveStore: Send + Sync {
    /// Creates a new writable drive for `pair`, persisting its secret.
    async fn create(&self, pair: KeyPair) -> Result<Arc<dyn Drive>, DriveError>;

    /// Opens the drive for `key`: the local one if known, else an empty replica.
    async fn open(&self, key: &HyperKey) -> Result<Arc<dyn Drive>, DriveError>;

    /// Forgets the drive for `key` and deletes its log and secret.
    async fn remove(&self, key: &HyperKey) -> Result<(), DriveError>;

    /// Appends every file under `dir` whose content differs from the drive.
    ///
    /// Dotfiles and `skip` are ignored. Busy files are reported rather than
    /// failing the import.
    async fn import_files(
        &self,
        drive: &dyn Drive,
        dir: &Path,
        skip: &[&str],
    ) -> Result<ImportReport, DriveError> {
        let mut report = ImportReport::default();
        for rel in walk(dir)? {
            if skip.contains(&rel.as_str()) {
                continue;
            }
            let data = match tokio::fs::read(dir.join(&rel)).await {
                Ok(data) => data,
                Err(e) if e.raw_os_error() == Some(EBUSY) => {
                    report.busy.push(rel);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match drive.read_file(&rel).await {
                Ok(existing) if existing == data => continue,
                Ok(_) | Err(DriveError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            drive.write_file(&rel, data).await?;
            report.imported.push(rel);
        }
        Ok(report)
    }

    /// Writes every file of `drive` into `dir`.
    async fn download_files(&self, drive: &dyn Drive, dir: &Path) -> Result<usize, DriveError> {
        let files = drive.readdir().await?;
        for rel in &files {
            let data = drive.read_file(rel).await?;
            let target = dir.join(rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, data).await?;
        }
        Ok(files.len())
    }
}

/// Relative paths of all non-dot files under `dir`, sorted.
fn walk(dir: &Path) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(rel.join("/"));
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Drive store over [`LogDrive`]s.
///
/// With directories configured, secrets go to `keys_dir` and logs to
/// `logs_dir/<hex>.log`; without them drives live only in memory.
#[derive(Default)]
pub struct LogDriveStore {
    keys_dir: Option<PathBuf>,
    logs_dir: Option<PathBuf>,
    drives: DashMap<HyperKey, Arc<LogDrive>>,
}

impl LogDriveStore {
    /// Store that keeps drives in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store persisting secrets and logs to disk.
    pub fn persistent(keys_dir: PathBuf, logs_dir: PathBuf) -> Result<Self, DriveError> {
        std::fs::create_dir_all(&keys_dir)?;
        std::fs::create_dir_all(&logs_dir)?;
        info!(keys = %keys_dir.display(), logs = %logs_dir.display(), "opened drive store");
        Ok(Self {
            keys_dir: Some(keys_dir),
            logs_dir: Some(logs_dir),
            drives: DashMap::new(),
        })
    }

    fn log_path(&self, key: &HyperKey) -> Option<PathBuf> {
        self.logs_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", key.to_hex())))
    }
}

#[async_trait]
impl DriveStore for LogDriveStore {
    async fn create(&self, pair: KeyPair) -> Result<Arc<dyn Drive>, DriveError> {
        let key = pair.public();
        if let Some(dir) = &self.keys_dir {
            pair.save(dir)?;
        }
        let drive = Arc::new(LogDrive::new(pair, self.log_path(&key)));
        self.drives.insert(key, Arc::clone(&drive));
        debug!(key = %key, "created drive");
        Ok(drive)
    }

    async fn open(&self, key: &HyperKey) -> Result<Arc<dyn Drive>, DriveError> {
        if let Some(drive) = self.drives.get(key).map(|d| Arc::clone(d.value())) {
            if !drive.closed.load(Ordering::Acquire) {
                return Ok(drive);
            }
        }
        let signer = match &self.keys_dir {
            Some(dir) => KeyPair::load(dir, key)?,
            None => None,
        };
        let path = self.log_path(key);
        let drive = match path {
            Some(path) if path.exists() => LogDrive::load(*key, signer, path).await?,
            path => match signer {
                Some(pair) => LogDrive::new(pair, path),
                None => LogDrive::replica(*key, path),
            },
        };
        let drive = Arc::new(drive);
        self.drives.insert(*key, Arc::clone(&drive));
        Ok(drive)
    }

    async fn remove(&self, key: &HyperKey) -> Result<(), DriveError> {
        if let Some((_, drive)) = self.drives.remove(key) {
            drive.close().await?;
        }
        if let Some(path) = self.log_path(key) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(dir) = &self.keys_dir {
            KeyPair::remove(dir, key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_bump_version() {
        let drive = LogDrive::new(KeyPair::generate(), None);
        assert_eq!(drive.version().await, 0);
        assert_eq!(drive.write_file("a.md", b"one".to_vec()).await.unwrap(), 1);
        assert_eq!(drive.write_file("a.md", b"two".to_vec()).await.unwrap(), 2);
        assert_eq!(drive.read_file("a.md").await.unwrap(), b"two");
        assert_eq!(drive.stat("a.md").await.unwrap().unwrap().version, 2);
        assert!(drive.stat("b.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkout_is_immutable_prefix() {
        let drive = LogDrive::new(KeyPair::generate(), None);
        drive.write_file("a.md", b"one".to_vec()).await.unwrap();
        drive.write_file("a.md", b"two".to_vec()).await.unwrap();

        let v1 = drive.checkout(1).await.unwrap();
        assert_eq!(v1.read_file("a.md").await.unwrap(), b"one");
        assert!(!v1.writable());
        assert!(v1.write_file("a.md", vec![]).await.is_err());

        drive.write_file("a.md", b"three".to_vec()).await.unwrap();
        assert_eq!(v1.version().await, 1);
        assert_eq!(v1.read_file("a.md").await.unwrap(), b"one");
        assert!(matches!(
            drive.checkout(9).await,
            Err(DriveError::VersionNotFound { requested: 9, current: 3 })
        ));
    }

    #[tokio::test]
    async fn test_replication_verifies_signatures() {
        let pair = KeyPair::generate();
        let origin = LogDrive::new(pair.clone(), None);
        origin.write_file("index.json", b"{}".to_vec()).await.unwrap();
        origin.write_file("main.md", b"hi".to_vec()).await.unwrap();

        let replica = LogDrive::replica(pair.public(), None);
        let entries = origin.export_log(0).await.unwrap();
        assert_eq!(replica.import_log(0, entries.clone()).await.unwrap(), 2);
        // re-importing overlapping entries is a no-op
        assert_eq!(replica.import_log(0, entries).await.unwrap(), 0);
        assert_eq!(replica.read_file("main.md").await.unwrap(), b"hi");
        assert!(!replica.writable());

        let mut forged = origin.export_log(1).await.unwrap();
        forged[0].data = b"tampered".to_vec();
        let other = LogDrive::replica(pair.public(), None);
        other.import_log(0, origin.export_log(0).await.unwrap()[..1].to_vec())
            .await
            .unwrap();
        assert!(matches!(
            other.import_log(1, forged).await,
            Err(DriveError::InvalidSignature { seq: 1 })
        ));
        assert!(matches!(
            other.import_log(5, vec![]).await,
            Err(DriveError::LogGap { local: 1, from: 5 })
        ));
    }

    #[tokio::test]
    async fn test_persistent_store_reopens() {
        let dir = TempDir::new().unwrap();
        let store =
            LogDriveStore::persistent(dir.path().join("keys"), dir.path().join("logs")).unwrap();
        let drive = store.create(KeyPair::generate()).await.unwrap();
        let key = drive.key();
        drive.write_file("index.json", b"{}".to_vec()).await.unwrap();
        drive.close().await.unwrap();

        let reopened =
            LogDriveStore::persistent(dir.path().join("keys"), dir.path().join("logs")).unwrap();
        let drive = reopened.open(&key).await.unwrap();
        assert!(drive.writable());
        assert_eq!(drive.version().await, 1);
        assert_eq!(drive.read_file("index.json").await.unwrap(), b"{}");

        reopened.remove(&key).await.unwrap();
        let fresh = reopened.open(&key).await.unwrap();
        assert!(!fresh.writable());
        assert_eq!(fresh.version().await, 0);
    }

    #[tokio::test]
    async fn test_import_and_download_files() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("data")).unwrap();
        std::fs::write(src.path().join("main.md"), "hello").unwrap();
        std::fs::write(src.path().join("data/table.csv"), "a,b").unwrap();
        std::fs::write(src.path().join(".hidden"), "x").unwrap();
        std::fs::write(src.path().join("index.json"), "{}").unwrap();

        let store = LogDriveStore::in_memory();
        let drive = store.create(KeyPair::generate()).await.unwrap();
        let report = store
            .import_files(drive.as_ref(), src.path(), &["index.json"])
            .await
            .unwrap();
        assert_eq!(report.imported, vec!["data/table.csv", "main.md"]);
        assert_eq!(drive.version().await, 2);

        // unchanged files are not appended again
        let report = store
            .import_files(drive.as_ref(), src.path(), &["index.json"])
            .await
            .unwrap();
        assert!(report.imported.is_empty());
        assert_eq!(drive.version().await, 2);

        let dst = TempDir::new().unwrap();
        assert_eq!(store.download_files(drive.as_ref(), dst.path()).await.unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(dst.path().join("data/table.csv")).unwrap(),
            "a,b"
        );
    }

    #[tokio::test]
    async fn test_closed_drive_rejects_io() {
        let drive = LogDrive::new(KeyPair::generate(), None);
        drive.close().await.unwrap();
        assert!(matches!(
            drive.read_file("x").await,
            Err(DriveError::Closed)
        ));
    }
}
