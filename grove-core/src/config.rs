//! Configuration for the grove services.
//!
//! Configuration lives in a single TOML file (default `~/.grove/config.toml`,
//! overridable with `GROVE_CONFIG_PATH`) and is immutable after startup.
//! Saving is atomic: the file is written to a temp path and renamed into
//! place.

use crate::error::{GroveError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable names recognized as overrides.
pub const ENV_CONFIG_PATH: &str = "GROVE_CONFIG_PATH";
pub const ENV_DATA_DIR: &str = "GROVE_DATA_DIR";
pub const ENV_LOG_LEVEL: &str = "GROVE_LOG_LEVEL";
pub const ENV_CACHE_SIZE_MB: &str = "GROVE_CACHE_SIZE_MB";
pub const ENV_POLL_INTERVAL_MS: &str = "GROVE_POLL_INTERVAL_MS";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroveConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub merger: MergerConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Directory layout for the stores and queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding content.db, schema.db, users.db, audit.db
    pub data_dir: PathBuf,
    /// Directory holding live session stores
    pub sessions_dir: PathBuf,
    /// Queue root containing pending/, processing/, done/, failed/
    pub queue_dir: PathBuf,
    /// Destination for `grove backup`
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are reported inactive
    pub max_inactive_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergerConfig {
    /// Sleep between queue sweeps
    pub poll_interval_ms: u64,
    /// Retries for transient errors within one sweep
    pub max_retries: u32,
    /// SQLite busy timeout for store access
    pub lock_timeout_ms: u64,
    /// Move interrupted `processing/` files to `failed/` on boot
    pub recover_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    pub interval_hours: u64,
    /// Active sessions idle this long are reclaimed
    pub abandoned_days: u64,
    /// Age bound for files in done/
    pub merged_days: u64,
    /// Age bound for files in failed/
    pub failed_archive_days: u64,
    pub audit_retention_days: u64,
    pub audit_archive_after_days: u64,
    /// Free-page percentage above which a store is compacted
    pub vacuum_threshold: u8,
    /// Compaction only runs inside this local-hour window
    pub vacuum_start_hour: u8,
    pub vacuum_end_hour: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_size_mb: u64,
    pub ttl_hours: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// trace, debug, info, warn, error
    pub level: String,
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".grove")
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = base_dir();
        Self {
            data_dir: base.join("data"),
            sessions_dir: base.join("sessions"),
            queue_dir: base.join("queue"),
            backup_dir: base.join("backups"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactive_hours: 24,
        }
    }
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_retries: 3,
            lock_timeout_ms: 30_000,
            recover_on_startup: true,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            abandoned_days: 7,
            merged_days: 1,
            failed_archive_days: 30,
            audit_retention_days: 90,
            audit_archive_after_days: 30,
            vacuum_threshold: 20,
            vacuum_start_hour: 2,
            vacuum_end_hour: 5,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: base_dir().join("cache"),
            max_size_mb: 100,
            ttl_hours: 24,
            enabled: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for GroveConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
            merger: MergerConfig::default(),
            gc: GcConfig::default(),
            cache: CacheConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl GroveConfig {
    /// Resolve the config file path, honoring `GROVE_CONFIG_PATH`.
    pub fn config_path() -> PathBuf {
        std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir().join("config.toml"))
    }

    /// Load configuration from a specific path.
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GroveError::config(format!("failed to read config file: {e}")))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| GroveError::config(format!("failed to parse config file: {e}")))?;

        config.merge_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load from the default location, creating a default file if absent.
    pub async fn load_or_create_default() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from_path(&path).await
        } else {
            info!("Creating default configuration at {}", path.display());
            let mut config = Self::default();
            config.merge_env_vars()?;
            config.save_to_path(&path).await?;
            Ok(config)
        }
    }

    /// Save atomically to a specific path (temp file + rename).
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GroveError::config(format!("failed to create config dir: {e}")))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GroveError::config(format!("failed to serialize config: {e}")))?;

        let temp_path = path.with_extension("toml.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| GroveError::config(format!("failed to write config file: {e}")))?;
        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| GroveError::config(format!("failed to rename config file: {e}")))?;

        Ok(())
    }

    /// Apply environment variable overrides.
    pub fn merge_env_vars(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            let base = PathBuf::from(dir);
            self.storage.data_dir = base.join("data");
            self.storage.sessions_dir = base.join("sessions");
            self.storage.queue_dir = base.join("queue");
            self.storage.backup_dir = base.join("backups");
            self.cache.dir = base.join("cache");
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.log.level = level;
        }
        if let Ok(size) = std::env::var(ENV_CACHE_SIZE_MB) {
            self.cache.max_size_mb = size
                .parse()
                .map_err(|e| GroveError::config(format!("invalid {ENV_CACHE_SIZE_MB}: {e}")))?;
        }
        if let Ok(ms) = std::env::var(ENV_POLL_INTERVAL_MS) {
            self.merger.poll_interval_ms = ms
                .parse()
                .map_err(|e| GroveError::config(format!("invalid {ENV_POLL_INTERVAL_MS}: {e}")))?;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log.level.as_str()) {
            return Err(GroveError::config(format!(
                "invalid log level '{}', must be one of: {}",
                self.log.level,
                valid_levels.join(", ")
            )));
        }
        if self.merger.poll_interval_ms == 0 {
            return Err(GroveError::config("poll_interval_ms must be greater than 0"));
        }
        if self.gc.interval_hours == 0 {
            return Err(GroveError::config("gc interval_hours must be greater than 0"));
        }
        if self.gc.vacuum_threshold > 100 {
            return Err(GroveError::config("vacuum_threshold is a percentage (0-100)"));
        }
        if self.gc.vacuum_start_hour > 23 || self.gc.vacuum_end_hour > 23 {
            return Err(GroveError::config("vacuum hours must be within 0-23"));
        }
        if self.cache.enabled && self.cache.max_size_mb == 0 {
            return Err(GroveError::config(
                "cache max_size_mb must be greater than 0 when the cache is enabled",
            ));
        }
        Ok(())
    }

    /// Create every directory the services expect.
    pub async fn ensure_directories(&self) -> Result<()> {
        let queue = &self.storage.queue_dir;
        let dirs = [
            self.storage.data_dir.clone(),
            self.storage.sessions_dir.clone(),
            self.storage.backup_dir.clone(),
            self.cache.dir.clone(),
            queue.join("pending"),
            queue.join("processing"),
            queue.join("done"),
            queue.join("failed"),
        ];
        for dir in dirs {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                GroveError::config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}
