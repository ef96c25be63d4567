//! Transfer engine configuration.
//!
//! [`TransferConfig`] carries every tunable the transfer slot consults. It is
//! built from defaults, optionally overlaid by an INI file:
//!
//! ```ini
//! [transfer]
//! download_connections = 4
//! upload_connections = 3
//! max_download_request_size = 16777216
//! timeout_secs = 60
//! worker_threads = 4
//!
//! [raid]
//! all_shards = false
//! header_timeout_secs = 30
//! max_slow_shard_swaps = 2
//!
//! [logging]
//! level = info
//! file = /var/log/cloudraid.log
//! ```
//!
//! Keys that are absent keep their defaults; a present key with an
//! unparseable value is an error rather than silently ignored.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::logging::LoggingConfig;

// ==================== Connection Defaults ====================

/// Default parallel connections for a non-raid download.
pub const DEFAULT_DOWNLOAD_CONNECTIONS: usize = 4;

/// Default parallel connections for an upload.
pub const DEFAULT_UPLOAD_CONNECTIONS: usize = 3;

/// Default upper bound on the bytes requested by one download request.
pub const DEFAULT_MAX_DOWNLOAD_REQUEST_SIZE: u64 = 16 * 1024 * 1024;

/// Smallest upload chunk once throughput is known.
pub const DEFAULT_MIN_UPLOAD_REQUEST_SIZE: u64 = 1024 * 1024;

/// Largest upload chunk.
pub const DEFAULT_MAX_UPLOAD_REQUEST_SIZE: u64 = 32 * 1024 * 1024;

/// Largest span between the earliest in-flight upload chunk and a new one.
pub const DEFAULT_MAX_UPLOAD_GAP: u64 = 256 * 1024 * 1024;

// ==================== Timing Defaults ====================

/// Seconds without any received data before the watchdog fires.
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 60;

/// Milliseconds between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1000;

/// Seconds a raid request may wait for response headers.
pub const DEFAULT_RAID_HEADER_TIMEOUT_SECS: u64 = 30;

/// Backoff after a rate-limited (429) response.
pub const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 500;

/// Backoff after an over-quota response that carries no reset time.
pub const DEFAULT_OVER_QUOTA_BACKOFF_SECS: u64 = 3600;

/// Backoff after a transient local file error.
pub const DEFAULT_IO_RETRY_BACKOFF_MS: u64 = 1000;

// ==================== Policy Defaults ====================

/// Consecutive request errors tolerated before the transfer fails.
pub const DEFAULT_MAX_REQUEST_ERRORS: u32 = 4;

/// Slow-shard swaps allowed per transfer.
pub const DEFAULT_MAX_SLOW_SHARD_SWAPS: u32 = 2;

/// Default size of the decrypt/encrypt worker pool.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write config file {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("invalid value '{value}' for {section}.{key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// Tunables of the transfer engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    // ==================== Connections ====================
    /// Connections for a non-raid download. Raid always uses six.
    pub download_connections: usize,

    /// Connections for an upload.
    pub upload_connections: usize,

    /// Upper bound on one download request. Also sizes raid chunks.
    pub max_download_request_size: u64,

    /// Upload chunk bounds once throughput is known.
    pub min_upload_request_size: u64,
    pub max_upload_request_size: u64,

    /// Upload requests wait while they would start this far past the
    /// earliest unfinished chunk.
    pub max_upload_gap: u64,

    // ==================== Timing ====================
    pub timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub raid_header_timeout_secs: u64,
    pub rate_limit_backoff_ms: u64,
    pub over_quota_backoff_secs: u64,
    pub io_retry_backoff_ms: u64,

    // ==================== Policy ====================
    /// Consecutive errors tolerated; one more fails the transfer.
    pub max_request_errors: u32,

    /// Fetch all six shards (each skipping blocks in rotation) instead of five.
    pub all_shards: bool,

    /// Toggle the alternate `:8080` port on plain-http URLs after soft failures.
    pub auto_alt_port: bool,

    pub max_slow_shard_swaps: u32,

    /// Decrypt/encrypt worker threads.
    pub worker_threads: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_connections: DEFAULT_DOWNLOAD_CONNECTIONS,
            upload_connections: DEFAULT_UPLOAD_CONNECTIONS,
            max_download_request_size: DEFAULT_MAX_DOWNLOAD_REQUEST_SIZE,
            min_upload_request_size: DEFAULT_MIN_UPLOAD_REQUEST_SIZE,
            max_upload_request_size: DEFAULT_MAX_UPLOAD_REQUEST_SIZE,
            max_upload_gap: DEFAULT_MAX_UPLOAD_GAP,

            timeout_secs: DEFAULT_TRANSFER_TIMEOUT_SECS,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            raid_header_timeout_secs: DEFAULT_RAID_HEADER_TIMEOUT_SECS,
            rate_limit_backoff_ms: DEFAULT_RATE_LIMIT_BACKOFF_MS,
            over_quota_backoff_secs: DEFAULT_OVER_QUOTA_BACKOFF_SECS,
            io_retry_backoff_ms: DEFAULT_IO_RETRY_BACKOFF_MS,

            max_request_errors: DEFAULT_MAX_REQUEST_ERRORS,
            all_shards: false,
            auto_alt_port: true,
            max_slow_shard_swaps: DEFAULT_MAX_SLOW_SHARD_SWAPS,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl TransferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_download_connections(mut self, connections: usize) -> Self {
        self.download_connections = connections.max(1);
        self
    }

    pub fn with_upload_connections(mut self, connections: usize) -> Self {
        self.upload_connections = connections.max(1);
        self
    }

    pub fn with_max_download_request_size(mut self, size: u64) -> Self {
        self.max_download_request_size = size;
        self
    }

    pub fn with_all_shards(mut self, all_shards: bool) -> Self {
        self.all_shards = all_shards;
        self
    }

    pub fn with_auto_alt_port(mut self, enabled: bool) -> Self {
        self.auto_alt_port = enabled;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn raid_header_timeout(&self) -> Duration {
        Duration::from_secs(self.raid_header_timeout_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn over_quota_backoff(&self) -> Duration {
        Duration::from_secs(self.over_quota_backoff_secs)
    }

    pub fn io_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.io_retry_backoff_ms)
    }
}

/// On-disk configuration: transfer tunables plus logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Default location of the configuration file.
pub fn config_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cloudraid").join("config.ini"))
}

impl ConfigFile {
    /// Load from the default location; a missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_file_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let t = &mut config.transfer;

        if let Some(section) = ini.section(Some("transfer")) {
            let s = Section::new("transfer", section);
            s.read("download_connections", &mut t.download_connections)?;
            s.read("upload_connections", &mut t.upload_connections)?;
            s.read("max_download_request_size", &mut t.max_download_request_size)?;
            s.read("min_upload_request_size", &mut t.min_upload_request_size)?;
            s.read("max_upload_request_size", &mut t.max_upload_request_size)?;
            s.read("max_upload_gap", &mut t.max_upload_gap)?;
            s.read("timeout_secs", &mut t.timeout_secs)?;
            s.read("progress_interval_ms", &mut t.progress_interval_ms)?;
            s.read("rate_limit_backoff_ms", &mut t.rate_limit_backoff_ms)?;
            s.read("over_quota_backoff_secs", &mut t.over_quota_backoff_secs)?;
            s.read("io_retry_backoff_ms", &mut t.io_retry_backoff_ms)?;
            s.read("max_request_errors", &mut t.max_request_errors)?;
            s.read("auto_alt_port", &mut t.auto_alt_port)?;
            s.read("worker_threads", &mut t.worker_threads)?;
        }

        if let Some(section) = ini.section(Some("raid")) {
            let s = Section::new("raid", section);
            s.read("all_shards", &mut t.all_shards)?;
            s.read("header_timeout_secs", &mut t.raid_header_timeout_secs)?;
            s.read("max_slow_shard_swaps", &mut t.max_slow_shard_swaps)?;
        }

        if t.download_connections == 0 || t.upload_connections == 0 || t.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                section: "transfer".to_string(),
                key: "connections/worker_threads".to_string(),
                value: "0".to_string(),
            });
        }

        if let Some(section) = ini.section(Some("logging")) {
            let l = &mut config.logging;
            if let Some(level) = section.get("level") {
                l.level = level.trim().to_string();
            }
            if let Some(file) = section.get("file") {
                let file = file.trim();
                l.file = (!file.is_empty()).then(|| PathBuf::from(file));
            }
            Section::new("logging", section).read("ansi", &mut l.ansi)?;
        }

        Ok(config)
    }

    /// Serialise to INI.
    pub fn to_ini(&self) -> Ini {
        let t = &self.transfer;
        let mut ini = Ini::new();
        ini.with_section(Some("transfer"))
            .set("download_connections", t.download_connections.to_string())
            .set("upload_connections", t.upload_connections.to_string())
            .set("max_download_request_size", t.max_download_request_size.to_string())
            .set("min_upload_request_size", t.min_upload_request_size.to_string())
            .set("max_upload_request_size", t.max_upload_request_size.to_string())
            .set("max_upload_gap", t.max_upload_gap.to_string())
            .set("timeout_secs", t.timeout_secs.to_string())
            .set("progress_interval_ms", t.progress_interval_ms.to_string())
            .set("rate_limit_backoff_ms", t.rate_limit_backoff_ms.to_string())
            .set("over_quota_backoff_secs", t.over_quota_backoff_secs.to_string())
            .set("io_retry_backoff_ms", t.io_retry_backoff_ms.to_string())
            .set("max_request_errors", t.max_request_errors.to_string())
            .set("auto_alt_port", t.auto_alt_port.to_string())
            .set("worker_threads", t.worker_threads.to_string());
        ini.with_section(Some("raid"))
            .set("all_shards", t.all_shards.to_string())
            .set("header_timeout_secs", t.raid_header_timeout_secs.to_string())
            .set("max_slow_shard_swaps", t.max_slow_shard_swaps.to_string());

        let l = &self.logging;
        let file = l
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        ini.with_section(Some("logging"))
            .set("level", l.level.clone())
            .set("file", file)
            .set("ansi", l.ansi.to_string());
        ini
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        self.to_ini()
            .write_to_file(path)
            .map_err(|e| ConfigError::Write {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

/// Typed reads from one INI section.
struct Section<'a> {
    name: &'static str,
    props: &'a ini::Properties,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, props: &'a ini::Properties) -> Self {
        Self { name, props }
    }

    /// Overwrite `target` if `key` is present; reject unparseable values.
    fn read<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), ConfigError> {
        let Some(raw) = self.props.get(key) else {
            return Ok(());
        };
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            section: self.name.to_string(),
            key: key.to_string(),
            value: raw.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.download_connections, DEFAULT_DOWNLOAD_CONNECTIONS);
        assert_eq!(config.timeout(), Duration::from_secs(60));
        assert_eq!(config.raid_header_timeout(), Duration::from_secs(30));
        assert_eq!(config.progress_interval(), Duration::from_secs(1));
        assert_eq!(config.max_slow_shard_swaps, 2);
        assert!(!config.all_shards);
    }

    #[test]
    fn test_builder_setters() {
        let config = TransferConfig::new()
            .with_download_connections(0)
            .with_all_shards(true)
            .with_worker_threads(8)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.download_connections, 1);
        assert!(config.all_shards);
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.timeout_secs, 5);
    }

    #[test]
    fn test_parse_overrides_present_keys_only() {
        let config = ConfigFile::parse(
            "[transfer]\nupload_connections = 5\n\n[raid]\nall_shards = true\n\n[logging]\nlevel = debug\n",
        )
        .unwrap();
        assert_eq!(config.transfer.upload_connections, 5);
        assert_eq!(config.transfer.download_connections, DEFAULT_DOWNLOAD_CONNECTIONS);
        assert!(config.transfer.all_shards);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, None);
    }

    #[test]
    fn test_parse_rejects_bad_value() {
        let err = ConfigFile::parse("[transfer]\ntimeout_secs = soon\n").unwrap_err();
        match err {
            ConfigError::InvalidValue { section, key, value } => {
                assert_eq!(section, "transfer");
                assert_eq!(key, "timeout_secs");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_rejects_zero_workers() {
        assert!(ConfigFile::parse("[transfer]\nworker_threads = 0\n").is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.ini");

        let mut config = ConfigFile::default();
        config.transfer.max_download_request_size = 8 * 1024 * 1024;
        config.transfer.all_shards = true;
        config.logging.file = Some(dir.path().join("cloudraid.log"));
        config.save_to(&path).unwrap();

        let loaded = ConfigFile::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
