//! Engine configuration and the persisted `settings.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SdkError;

/// Settings file name inside the base directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Minimum spacing between swarm fetch attempts.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// User settings persisted in `<base_dir>/settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// How many follow hops are considered when walking profiles.
    pub network_depth: u32,
    /// Hex key of the default profile, empty until one exists.
    pub default_profile: String,
    /// Directory holding module secret keys, relative to the base dir.
    pub keys: PathBuf,
    /// Replicate drive content on demand only.
    pub sparse: bool,
    /// Replicate drive metadata on demand only.
    pub sparse_metadata: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network_depth: 3,
            default_profile: String::new(),
            keys: PathBuf::from(".keys"),
            sparse: true,
            sparse_metadata: true,
        }
    }
}

impl Settings {
    /// Loads settings from `base_dir`, writing defaults if the file is absent.
    pub fn load_or_create(base_dir: &Path) -> Result<Self, SdkError> {
        let path = base_dir.join(SETTINGS_FILE);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            return serde_json::from_str(&contents)
                .map_err(|e| SdkError::Config(format!("{}: {}", path.display(), e)));
        }
        let settings = Settings::default();
        settings.save(base_dir)?;
        info!(path = %path.display(), "created default settings");
        Ok(settings)
    }

    /// Writes settings to `base_dir`.
    pub fn save(&self, base_dir: &Path) -> Result<(), SdkError> {
        std::fs::create_dir_all(base_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(base_dir.join(SETTINGS_FILE), json)?;
        Ok(())
    }

    /// Absolute keys directory.
    pub fn keys_dir(&self, base_dir: &Path) -> PathBuf {
        if self.keys.is_absolute() {
            self.keys.clone()
        } else {
            base_dir.join(&self.keys)
        }
    }
}

/// Runtime configuration of an engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for settings, the index, drives and module files.
    pub base_dir: PathBuf,
    /// Persist the index and drives on disk; otherwise keep them in memory.
    pub persist: bool,
    /// Never touch the swarm, even if a networker is supplied.
    pub disable_swarm: bool,
    /// Attempts made when fetching a module from the swarm.
    pub fetch_retries: u32,
    /// Delay between fetch attempts, in milliseconds.
    pub fetch_retry_delay_ms: u64,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".p2pcommons"),
            persist: true,
            disable_swarm: false,
            fetch_retries: 3,
            fetch_retry_delay_ms: 500,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, SdkError> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| SdkError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Delay between fetch attempts, never below 500ms.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_delay_ms).max(MIN_RETRY_DELAY)
    }

    /// Fetch attempts, at least one.
    pub fn retries(&self) -> u32 {
        self.fetch_retries.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_or_create(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(SETTINGS_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["networkDepth"], 3);
        assert_eq!(raw["sparseMetadata"], true);
        assert_eq!(raw["defaultProfile"], "");
    }

    #[test]
    fn test_settings_round_trip_and_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{"defaultProfile": "abc", "sparse": false}"#,
        )
        .unwrap();
        let mut settings = Settings::load_or_create(dir.path()).unwrap();
        assert_eq!(settings.default_profile, "abc");
        assert!(!settings.sparse);
        assert_eq!(settings.network_depth, 3);

        settings.default_profile = "def".into();
        settings.save(dir.path()).unwrap();
        let reloaded = Settings::load_or_create(dir.path()).unwrap();
        assert_eq!(reloaded.default_profile, "def");
        assert_eq!(reloaded.keys_dir(dir.path()), dir.path().join(".keys"));
    }

    #[test]
    fn test_malformed_settings_is_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{not json").unwrap();
        assert!(matches!(
            Settings::load_or_create(dir.path()),
            Err(SdkError::Config(_))
        ));
    }

    #[test]
    fn test_retry_delay_is_clamped() {
        let mut config = EngineConfig::new("/tmp/x");
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        config.fetch_retry_delay_ms = 10;
        assert_eq!(config.retry_delay(), MIN_RETRY_DELAY);
        config.fetch_retry_delay_ms = 900;
        assert_eq!(config.retry_delay(), Duration::from_millis(900));
        config.fetch_retries = 0;
        assert_eq!(config.retries(), 1);
    }

    #[test]
    fn test_engine_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"base_dir": "/data", "persist": false}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/data"));
        assert!(!config.persist);
        assert_eq!(config.fetch_retries, 3);
    }
}
