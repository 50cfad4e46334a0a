//! FOX-DIE: Configuration management for SAMGUARD
//!
//! Handles loading and saving guard parameters from local storage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub mod paths;

pub use paths::{config_path, data_dir, default_db_path};

/// Environment override for the config file location.
pub const CONFIG_ENV: &str = "SAMGUARD_CONFIG";

/// Errors in configuration systems
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DATA LINK ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("DECRYPTION FAILED: {0}")]
    Json(#[from] serde_json::Error),

    #[error("INTEL NOT FOUND: {0}")]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_true() -> bool {
    true
}

/// One admission policy entry. Fields default to the catch-all policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PolicyEntry {
    #[serde(default = "default_requests")]
    pub requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for PolicyEntry {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            window_secs: default_window_secs(),
            burst: default_burst(),
        }
    }
}

fn default_requests() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_burst() -> u32 {
    10
}

/// Admission control parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides and additions to the built-in category policies.
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyEntry>,
    /// Action name to policy category aliases.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            policies: BTreeMap::new(),
            categories: BTreeMap::new(),
        }
    }
}

/// One retry policy. Several entries with disjoint only/exclude sets give
/// per-action retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            only: None,
            exclude: Vec::new(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retry_sections() -> Vec<RetrySection> {
    vec![RetrySection::default()]
}

/// Circuit breaker parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

/// Error archive parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    /// Durable SQLite archive when true, bounded in-memory ring otherwise.
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_max_memory_records")]
    pub max_memory_records: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            persistent: true,
            db_path: None,
            max_memory_records: default_max_memory_records(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_max_memory_records() -> usize {
    1_000
}

fn default_retention_days() -> u32 {
    30
}

/// Health surveillance parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_probe_timeout_secs() -> u64 {
    10
}

/// Invocation logging parameters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub include_args: bool,
    #[serde(default)]
    pub include_result: bool,
    /// Actions whose invocations are never logged.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Root guard parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default = "default_retry_sections")]
    pub retry: Vec<RetrySection>,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionSection::default(),
            retry: default_retry_sections(),
            breaker: BreakerSection::default(),
            tracker: TrackerSection::default(),
            health: HealthSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl GuardConfig {
    /// Load guard parameters, honoring the `SAMGUARD_CONFIG` override.
    pub async fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(custom) => PathBuf::from(custom),
            Err(_) => config_path(),
        };
        Self::load_from(&path).await
    }

    /// Load from a location the operator named explicitly. Unlike
    /// [`load_from`](Self::load_from), a missing file is an error here.
    pub async fn load_required(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load_from(path).await
    }

    /// Load from specific location
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("◆ NO INTEL FOUND AT {:?}, USING DEFAULTS", path);
            return Ok(GuardConfig::default());
        }

        debug!("◆ READING INTEL FROM {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: GuardConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save guard parameters
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("◆ WRITING INTEL TO {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Resolved error archive location: explicit config first, then the
    /// `SAMGUARD_DB_PATH` override, then the default under the data dir.
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(path) = &self.tracker.db_path {
            return path.clone();
        }
        default_db_path()
    }
}
