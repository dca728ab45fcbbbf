//! Coordinator configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dirscope_core::ScanError;

/// Default tombstone lifetime: 30 days.
const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Settings shared by every session of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Location of the cache database.
    pub cache_path: PathBuf,
    /// Worker threads for subtree walks (0 = number of CPUs).
    pub workers: usize,
    /// How long tombstoned records are kept before purging.
    pub tombstone_ttl_secs: u64,
    /// Publish progress every this many entries.
    pub progress_interval: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            workers: 0,
            tombstone_ttl_secs: DEFAULT_TOMBSTONE_TTL_SECS,
            progress_interval: 1000,
        }
    }
}

fn default_cache_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dirscope")
        .join("cache")
}

impl CoordinatorConfig {
    /// Path of the user configuration file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dirscope").join("config.toml"))
    }

    /// Load the user configuration, or return defaults.
    pub fn load() -> Self {
        Self::config_path()
            .and_then(|path| std::fs::read_to_string(&path).ok())
            .and_then(|content| toml::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path).map_err(|e| ScanError::InvalidConfig {
            message: format!("{}: {e}", path.display()),
        })?;
        toml::from_str(&content).map_err(|e| ScanError::InvalidConfig {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Tombstone lifetime.
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    /// Check the configuration for unusable values.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.progress_interval == 0 {
            return Err(ScanError::InvalidConfig {
                message: "progress_interval must be at least 1".to_string(),
            });
        }
        if self.cache_path.as_os_str().is_empty() {
            return Err(ScanError::InvalidConfig {
                message: "cache_path must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
