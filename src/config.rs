//! Loader configuration
//!
//! Every section has working defaults, so an empty YAML document is a valid
//! configuration:
//!
//! ```yaml
//! scheduler:
//!   max_parallel_tasks: 4
//! memory:
//!   high_watermark_bytes: 67108864
//!   low_watermark_bytes: 50331648
//! disk:
//!   path: /var/cache/imgload
//!   kind: journaled
//!   default_ttl_secs: 2592000
//!   sweep_interval_secs: 600
//! http:
//!   header_timeout_secs: 10
//!   read_timeout_secs: 30
//!   retry_count: 3
//!   retry_delay_ms: 250
//! bundle_root: /usr/share/myapp
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::{DiskCacheConfig, MemoryCacheConfig};
use crate::error::{Error, Result};
use crate::loader::HttpConfig;
use crate::scheduler::SchedulerConfig;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub scheduler: SchedulerConfig,
    pub memory: MemoryCacheConfig,
    pub disk: DiskCacheConfig,
    pub http: HttpConfig,

    /// Keep downloaded images on disk
    pub disk_cache_enabled: bool,

    /// Root directory for `bundle://` sources
    pub bundle_root: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            memory: MemoryCacheConfig::default(),
            disk: DiskCacheConfig::default(),
            http: HttpConfig::default(),
            disk_cache_enabled: true,
            bundle_root: None,
        }
    }
}

impl LoaderConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: LoaderConfig = if yaml.trim().is_empty() {
            LoaderConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.memory.validate()?;
        self.disk.validate()?;
        self.http.validate()?;
        Ok(())
    }
}
