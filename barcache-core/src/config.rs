//! TOML configuration. Every field has a default, so an empty file is a
//! valid configuration.

use crate::cache::LockPolicy;
use crate::domain::{AnchorError, WindowAnchor};
use crate::source::{HttpSourceConfig, SourceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid window anchor: {0}")]
    Anchor(#[from] AnchorError),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to build source: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub window: WindowConfig,
    pub service: ServiceConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 4h files live in `{dir}/4h/`.
    pub dir: PathBuf,
    pub lock_retries: u32,
    pub lock_backoff_ms: u64,
    pub stale_lock_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/cache"),
            lock_retries: 5,
            lock_backoff_ms: 50,
            stale_lock_secs: 120,
        }
    }
}

impl CacheConfig {
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            retries: self.lock_retries,
            backoff: Duration::from_millis(self.lock_backoff_ms),
            stale_after: Duration::from_secs(self.stale_lock_secs),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// UTC offset of the reference day, e.g. 480 for UTC+8.
    pub anchor_offset_minutes: i32,
}

impl WindowConfig {
    pub fn anchor(&self) -> Result<WindowAnchor, AnchorError> {
        WindowAnchor::from_offset_minutes(self.anchor_offset_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub memory_index: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { memory_index: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Csv {
        #[serde(default = "default_raw_dir")]
        dir: PathBuf,
    },
    Http(HttpSourceConfig),
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw_15m")
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Csv {
            dir: default_raw_dir(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window.anchor()?;

        if self.cache.dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "cache.dir",
                reason: "must not be empty".into(),
            });
        }
        if self.cache.stale_lock_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.stale_lock_secs",
                reason: "must be positive".into(),
            });
        }

        if let SourceConfig::Http(http) = &self.source {
            if http.base_url.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "source.base_url",
                    reason: "must not be empty".into(),
                });
            }
            if !(1..=10_000).contains(&http.page_limit) {
                return Err(ConfigError::Invalid {
                    field: "source.page_limit",
                    reason: format!("{} is outside 1..=10000", http.page_limit),
                });
            }
            if http.timeout_secs == 0 {
                return Err(ConfigError::Invalid {
                    field: "source.timeout_secs",
                    reason: "must be positive".into(),
                });
            }
        }
        Ok(())
    }

    /// The validated window anchor.
    pub fn anchor(&self) -> Result<WindowAnchor, ConfigError> {
        Ok(self.window.anchor()?)
    }
}
