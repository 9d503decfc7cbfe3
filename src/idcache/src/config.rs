//! Cache and daemon configuration loading and validation

use crate::error::{IdCacheError, Result};
use crate::well_known::WellKnown;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub well_known: WellKnown,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Cache TTLs and bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Lifetime of a positive record
    #[serde(default = "default_positive_ttl")]
    pub positive_ttl_secs: u64,

    /// Lifetime of a negative record
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,

    /// Lifetime override for kernel-facing lookups
    #[serde(default = "default_kernel_ttl")]
    pub kernel_ttl_secs: u64,

    /// Hard ceiling before a hit forces a refresh
    #[serde(default = "default_max_refresh")]
    pub max_refresh_secs: u64,

    /// Distinct records kept before LRU trimming
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Partitions starting with this prefix are local
    #[serde(default = "default_local_partition")]
    pub local_partition: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON directory seed
    #[serde(default)]
    pub seed_path: Option<PathBuf>,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

// Default value functions
fn default_positive_ttl() -> u64 { 4 * 60 * 60 }
fn default_negative_ttl() -> u64 { 2 * 60 * 60 }
fn default_kernel_ttl() -> u64 { 120 }
fn default_max_refresh() -> u64 { 15 * 60 }
fn default_max_entries() -> usize { 10_000 }
fn default_max_nesting_depth() -> usize { 32 }
fn default_local_partition() -> String { "/Local".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_sweep_interval() -> u64 { 60 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl_secs: default_positive_ttl(),
            negative_ttl_secs: default_negative_ttl(),
            kernel_ttl_secs: default_kernel_ttl(),
            max_refresh_secs: default_max_refresh(),
            max_entries: default_max_entries(),
            max_nesting_depth: default_max_nesting_depth(),
            local_partition: default_local_partition(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            seed_path: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn positive_ttl(&self) -> Duration {
        Duration::from_secs(self.positive_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn kernel_ttl(&self) -> Duration {
        Duration::from_secs(self.kernel_ttl_secs)
    }

    pub fn max_refresh(&self) -> Duration {
        Duration::from_secs(self.max_refresh_secs)
    }

    /// Whether `partition` counts as local
    pub fn is_local_partition(&self, partition: Option<&str>) -> bool {
        partition.map_or(true, |p| p.starts_with(&self.local_partition))
    }
}

impl DaemonConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration file {}", path.as_ref().display()))?;

        Self::from_toml_str(&contents).context("Failed to parse configuration file")
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.positive_ttl_secs == 0 || cache.negative_ttl_secs == 0 || cache.kernel_ttl_secs == 0 {
            return Err(IdCacheError::Config("cache TTLs must be non-zero".to_string()));
        }
        if cache.max_refresh_secs == 0 {
            return Err(IdCacheError::Config("max_refresh_secs must be non-zero".to_string()));
        }
        if cache.max_nesting_depth == 0 {
            return Err(IdCacheError::Config("max_nesting_depth must be at least 1".to_string()));
        }
        if cache.max_entries == 0 {
            return Err(IdCacheError::Config("max_entries must be at least 1".to_string()));
        }
        if self.daemon.sweep_interval_secs == 0 {
            return Err(IdCacheError::Config("sweep_interval_secs must be non-zero".to_string()));
        }
        Ok(())
    }
}
