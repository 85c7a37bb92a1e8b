//! # Daemon Configuration
//!
//! File-level configuration for the sync and backup engines.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DEVICE_ID=abc-123                                            │
//! │     TALLY_CLOUD_ENDPOINT=https://sync.example.com                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `[sync]` section only seeds the persisted [`SyncConfig`] on first run.
//! After that the stored copy (changed through `SyncEngine::update_config`)
//! is authoritative.
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! name = "Register 1"
//!
//! [cloud]
//! endpoint = "https://sync.example.com/api/"
//! token = "..."
//!
//! [sync]
//! interval_minutes = 15
//! conflict_strategy = "merge"
//!
//! [backup]
//! max_backups = 10
//! auto_interval = "daily"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use tally_core::{BackupInterval, ConflictStrategy, SyncConfig, SyncConfigUpdate};

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id used only when no identity has been persisted yet.
    #[serde(default)]
    pub id: Option<String>,

    /// Human-readable device name (e.g., "Register 1", "Back Office").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: None,
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Cloud Settings
// =============================================================================

/// Where snapshots are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Base URL of the snapshot API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token. Without one, cloud operations fail closed.
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://sync.tally-pos.app/api/".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            endpoint: default_endpoint(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_true")]
    pub auto_sync_enabled: bool,

    /// Minutes between periodic incremental syncs.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,

    /// Failed uploads per change record before it is dropped.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Skip background sync on metered connections.
    #[serde(default = "default_true")]
    pub respect_metered: bool,

    /// Upload attempts per cycle.
    #[serde(default = "default_upload_max_retries")]
    pub upload_max_retries: u32,

    /// Delay before the second upload attempt (milliseconds); doubles after.
    #[serde(default = "default_upload_base_delay")]
    pub upload_base_delay_ms: u64,

    /// Change records drained per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_true() -> bool {
    true
}
fn default_interval_minutes() -> u32 {
    15
}
fn default_max_retry_attempts() -> u32 {
    5
}
fn default_upload_max_retries() -> u32 {
    3
}
fn default_upload_base_delay() -> u64 {
    1000
}
fn default_batch_size() -> u32 {
    500
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            auto_sync_enabled: true,
            interval_minutes: default_interval_minutes(),
            max_retry_attempts: default_max_retry_attempts(),
            conflict_strategy: ConflictStrategy::default(),
            respect_metered: true,
            upload_max_retries: default_upload_max_retries(),
            upload_base_delay_ms: default_upload_base_delay(),
            batch_size: default_batch_size(),
        }
    }
}

// =============================================================================
// Backup Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Backups kept in the index; older ones are evicted with their payload.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Automatic backup cadence; `None` disables the timer.
    #[serde(default)]
    pub auto_interval: Option<BackupInterval>,
}

fn default_max_backups() -> usize {
    10
}

impl Default for BackupSettings {
    fn default() -> Self {
        BackupSettings {
            max_backups: default_max_backups(),
            auto_interval: None,
        }
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Connectivity probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// `host:port` the TCP probe connects to.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Seconds between connectivity refreshes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_probe_host() -> String {
    "1.1.1.1:443".to_string()
}
fn default_probe_timeout() -> u64 {
    3000
}
fn default_poll_interval() -> u64 {
    30
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            probe_host: default_probe_host(),
            probe_timeout_ms: default_probe_timeout(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `tally.db` in the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub cloud: CloudSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub backup: BackupSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl TallyConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let endpoint = url::Url::parse(&self.cloud.endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Endpoint must start with http:// or https://, got: {}",
                self.cloud.endpoint
            )));
        }

        if self.sync.interval_minutes == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_minutes must be greater than 0".into(),
            ));
        }

        if self.sync.max_retry_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_retry_attempts must be greater than 0".into(),
            ));
        }

        if self.sync.upload_max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "upload_max_retries must be greater than 0".into(),
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.backup.max_backups == 0 {
            return Err(SyncError::InvalidConfig(
                "max_backups must be greater than 0".into(),
            ));
        }

        if let Some(id) = &self.device.id {
            if id.trim().is_empty() {
                return Err(SyncError::InvalidConfig("device id must not be blank".into()));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = Some(id);
        }

        if let Ok(name) = std::env::var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(endpoint) = std::env::var("TALLY_CLOUD_ENDPOINT") {
            debug!(endpoint = %endpoint, "Overriding cloud endpoint from environment");
            self.cloud.endpoint = endpoint;
        }

        if let Ok(token) = std::env::var("TALLY_CLOUD_TOKEN") {
            self.cloud.token = Some(token);
        }

        if let Ok(minutes) = std::env::var("TALLY_SYNC_INTERVAL_MINUTES") {
            if let Ok(m) = minutes.parse::<u32>() {
                self.sync.interval_minutes = m;
            }
        }

        if let Ok(enabled) = std::env::var("TALLY_AUTO_SYNC") {
            if let Ok(e) = enabled.parse::<bool>() {
                self.sync.auto_sync_enabled = e;
            }
        }

        if let Ok(strategy) = std::env::var("TALLY_CONFLICT_STRATEGY") {
            match strategy.parse::<ConflictStrategy>() {
                Ok(parsed) => self.sync.conflict_strategy = parsed,
                Err(e) => warn!(strategy = %strategy, %e, "Ignoring conflict strategy from environment"),
            }
        }

        if let Ok(interval) = std::env::var("TALLY_BACKUP_INTERVAL") {
            match interval.parse::<BackupInterval>() {
                Ok(parsed) => self.backup.auto_interval = Some(parsed),
                Err(e) => warn!(interval = %interval, %e, "Ignoring backup interval from environment"),
            }
        }

        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Database file, falling back to the platform data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.clone().or_else(|| {
            directories::ProjectDirs::from("com", "tally", "pos")
                .map(|dirs| dirs.data_dir().join("tally.db"))
        })
    }

    /// Seed for the persisted sync configuration.
    pub fn seed_sync_config(&self, device_id: &str) -> SyncConfig {
        let mut seed = SyncConfig::new(device_id);
        seed.auto_sync_enabled = self.sync.auto_sync_enabled;
        seed.sync_interval_minutes = self.sync.interval_minutes;
        seed.max_retry_attempts = self.sync.max_retry_attempts;
        seed.conflict_resolution_strategy = self.sync.conflict_strategy;
        seed.respect_metered = self.sync.respect_metered;
        seed
    }

    /// The file's sync settings as an update over a persisted configuration.
    pub fn sync_config_update(&self) -> SyncConfigUpdate {
        SyncConfigUpdate {
            auto_sync_enabled: Some(self.sync.auto_sync_enabled),
            sync_interval_minutes: Some(self.sync.interval_minutes),
            max_retry_attempts: Some(self.sync.max_retry_attempts),
            conflict_resolution_strategy: Some(self.sync.conflict_strategy),
            respect_metered: Some(self.sync.respect_metered),
        }
    }

    pub fn upload_base_delay(&self) -> Duration {
        Duration::from_millis(self.sync.upload_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.network.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.network.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TallyConfig::default();
        assert!(config.device.id.is_none());
        assert_eq!(config.sync.interval_minutes, 15);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::LocalWins);
        assert_eq!(config.backup.max_backups, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TallyConfig::default();

        config.cloud.endpoint = "ftp://example.com".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.cloud.endpoint = "not a url".into();
        assert!(config.validate().is_err());

        config.cloud.endpoint = "https://example.com/api/".into();
        config.sync.interval_minutes = 0;
        assert!(config.validate().is_err());

        config.sync.interval_minutes = 5;
        config.sync.max_retry_attempts = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        config.sync.max_retry_attempts = 3;
        config.device.id = Some("  ".into());
        assert!(config.validate().is_err());

        config.device.id = Some("register-1".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config: TallyConfig = toml::from_str(
            r#"
            [sync]
            interval_minutes = 5
            conflict_strategy = "manual"

            [backup]
            auto_interval = "weekly"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.interval_minutes, 5);
        assert_eq!(config.sync.conflict_strategy, ConflictStrategy::Manual);
        assert_eq!(config.sync.upload_max_retries, 3);
        assert_eq!(config.backup.auto_interval, Some(BackupInterval::Weekly));
        assert_eq!(config.device.name, "POS Terminal");
    }

    #[test]
    fn test_seed_sync_config() {
        let mut config = TallyConfig::default();
        config.sync.conflict_strategy = ConflictStrategy::RemoteWins;
        config.sync.auto_sync_enabled = false;

        let seed = config.seed_sync_config("device-a");
        assert_eq!(seed.device_id, "device-a");
        assert_eq!(seed.conflict_resolution_strategy, ConflictStrategy::RemoteWins);
        assert!(!seed.auto_sync_enabled);
        assert!(seed.last_sync_timestamp.is_none());
    }

    #[test]
    fn test_sync_config_update_carries_file_settings() {
        let mut config = TallyConfig::default();
        config.sync.interval_minutes = 30;
        config.sync.respect_metered = false;

        let mut persisted = SyncConfig::new("device-a");
        persisted.conflict_resolution_strategy = ConflictStrategy::Manual;
        let reschedule = config.sync_config_update().apply_to(&mut persisted);

        assert!(reschedule);
        assert_eq!(persisted.sync_interval_minutes, 30);
        assert!(!persisted.respect_metered);
        assert_eq!(persisted.conflict_resolution_strategy, ConflictStrategy::LocalWins);
        assert_eq!(persisted.device_id, "device-a");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = TallyConfig::default();
        config.device.name = "Back Office".into();
        config.backup.auto_interval = Some(BackupInterval::Daily);
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[device]"));
        assert!(contents.contains("[sync]"));

        let reloaded: TallyConfig = toml::from_str(&contents).unwrap();
        assert_eq!(reloaded.device.name, "Back Office");
        assert_eq!(reloaded.backup.auto_interval, Some(BackupInterval::Daily));
    }
}
