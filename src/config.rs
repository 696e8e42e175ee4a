//! Configuration for the directory, lock and NRT components.
//!
//! Every struct has a `Default` and derives serde, so a deployment can be
//! described in one JSON document:
//!
//! ```
//! use stratus::config::{LockStrategy, StratusConfig};
//!
//! let config = StratusConfig::from_json_str(
//!     r#"{
//!         "container": "catalog",
//!         "cache_path": "/var/cache/catalog",
//!         "directory": { "root_folder": "products", "compress": true },
//!         "lock": { "strategy": "MarkerFile" }
//!     }"#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.directory.root_folder.as_deref(), Some("products"));
//! assert_eq!(config.lock.strategy, LockStrategy::MarkerFile);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratusError};

/// How a [`crate::sync::lock::DistributedLock`] excludes other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LockStrategy {
    /// A renewable lease on a marker object.
    #[default]
    Lease,

    /// The existence of a marker object. A crashed holder leaves the lock
    /// torn until it is broken explicitly.
    MarkerFile,
}

/// Configuration of distributed locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub strategy: LockStrategy,

    /// Lifetime of a lease before it must be renewed.
    pub lease_duration: Duration,

    /// How often a held lease is renewed.
    pub renew_interval: Duration,

    /// Optional prefix joined to lock names with `-`.
    pub lock_prefix: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            strategy: LockStrategy::Lease,
            lease_duration: Duration::from_secs(60),
            renew_interval: Duration::from_secs(30),
            lock_prefix: None,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(StratusError::invalid_config("lease duration must be positive"));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_duration {
            return Err(StratusError::invalid_config(
                "renew interval must be positive and shorter than the lease duration",
            ));
        }
        Ok(())
    }
}

/// Configuration of a [`crate::sync::SyncDirectory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncDirectoryConfig {
    /// Folder inside the container holding this index, if any.
    pub root_folder: Option<String>,

    /// Compress eligible segment files before upload.
    pub compress: bool,

    /// zstd compression level.
    pub compression_level: i32,

    /// Allowed difference between stamped and cached modification times,
    /// in milliseconds.
    pub clock_skew_tolerance_ms: u64,
}

impl Default for SyncDirectoryConfig {
    fn default() -> Self {
        SyncDirectoryConfig {
            root_folder: None,
            compress: false,
            compression_level: 3,
            clock_skew_tolerance_ms: 1000,
        }
    }
}

impl SyncDirectoryConfig {
    /// Object name prefix for files of this directory: the root folder with
    /// a trailing `/`, or nothing.
    pub fn prefix(&self) -> String {
        match self.root_folder.as_deref().map(|f| f.trim_matches('/')) {
            Some(folder) if !folder.is_empty() => format!("{folder}/"),
            _ => String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=22).contains(&self.compression_level) {
            return Err(StratusError::invalid_config(format!(
                "compression level {} is outside 1..=22",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Staleness bounds of near-real-time reopening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NrtConfig {
    /// Reopen delay while a reader is waiting for a generation.
    pub target_min_stale: Duration,

    /// Reopen delay while nobody is waiting.
    pub target_max_stale: Duration,

    /// Whether background reopens apply deletes when nobody asked for them.
    pub apply_all_deletes: bool,
}

impl Default for NrtConfig {
    fn default() -> Self {
        NrtConfig {
            target_min_stale: Duration::from_millis(100),
            target_max_stale: Duration::from_secs(5),
            apply_all_deletes: true,
        }
    }
}

impl NrtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_min_stale > self.target_max_stale {
            return Err(StratusError::invalid_config(format!(
                "min staleness {:?} exceeds max staleness {:?}",
                self.target_min_stale, self.target_max_stale
            )));
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// with up to 10% random jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self
            .initial_backoff
            .mul_f64(self.multiplier.max(1.0).powi(exponent))
            .min(self.max_backoff);
        base + base.mul_f64(0.1 * rand::random::<f64>())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(StratusError::invalid_config("max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(StratusError::invalid_config("multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

/// Schedule of the background committer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitterConfig {
    pub commit_interval: Duration,
    pub optimize_interval: Duration,
    pub retry: RetryPolicy,

    /// Commit once more when the committer is closed.
    pub commit_on_close: bool,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        CommitterConfig {
            commit_interval: Duration::from_secs(60),
            optimize_interval: Duration::from_secs(60 * 60),
            retry: RetryPolicy::default(),
            commit_on_close: true,
        }
    }
}

impl CommitterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.commit_interval.is_zero() {
            return Err(StratusError::invalid_config("commit interval must be positive"));
        }
        self.retry.validate()
    }
}

/// Configuration of a complete remote-backed index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratusConfig {
    /// Remote container holding the index.
    pub container: String,

    /// Local cache directory.
    pub cache_path: PathBuf,

    pub directory: SyncDirectoryConfig,
    pub lock: LockConfig,
    pub nrt: NrtConfig,
    pub committer: CommitterConfig,
}

impl Default for StratusConfig {
    fn default() -> Self {
        StratusConfig {
            container: "index".to_string(),
            cache_path: std::env::temp_dir().join("stratus-cache"),
            directory: SyncDirectoryConfig::default(),
            lock: LockConfig::default(),
            nrt: NrtConfig::default(),
            committer: CommitterConfig::default(),
        }
    }
}

impl StratusConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StratusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.container.is_empty() {
            return Err(StratusError::invalid_config("container name is empty"));
        }
        self.directory.validate()?;
        self.lock.validate()?;
        self.nrt.validate()?;
        self.committer.validate()
    }
}
