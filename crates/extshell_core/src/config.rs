//! Typed shell configuration.
//!
//! # Responsibility
//! - Hold tunables for registry, loader, asset cache and event bus.
//! - Load them from JSON with every field optional.
//!
//! # Invariants
//! - `ShellConfig::default()` is always valid.
//! - `validate()` runs before any config reaches a service constructor via
//!   `from_json_str`.

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::extension::version::Version;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_MAX_RESIDENT_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_EVICTION_FRACTION: f64 = 0.3;
const DEFAULT_EVICTION_DEBOUNCE_MS: u64 = 50;
const DEFAULT_RETRY: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// What reconciliation does with stored entries missing from the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Flag the entry as removed and keep it, preserving `enabled` history.
    #[default]
    MarkAndKeep,
    /// Drop the entry from memory and storage.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub removal_policy: RemovalPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Running framework version checked against `minFrameworkVersion`.
    pub framework_version: String,
    /// Maximum simultaneous chains in `load_all`; `0` means unbounded.
    pub max_concurrency: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            framework_version: Version::current().to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetCacheConfig {
    /// Resident size above which an eviction pass is scheduled.
    pub max_resident_bytes: u64,
    /// Minimum share of entries (oldest first) removed by one pass.
    pub eviction_fraction: f64,
    /// Delay before a scheduled pass runs; `0` evicts inline.
    pub eviction_debounce_ms: u64,
    /// Default extra attempts after the first transient failure.
    pub retry: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
    pub ttl_ms: Option<u64>,
}

impl AssetCacheConfig {
    pub fn eviction_debounce(&self) -> Duration {
        Duration::from_millis(self.eviction_debounce_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self {
            max_resident_bytes: DEFAULT_MAX_RESIDENT_BYTES,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
            eviction_debounce_ms: DEFAULT_EVICTION_DEBOUNCE_MS,
            retry: DEFAULT_RETRY,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            ttl_ms: None,
        }
    }
}

/// Top-level configuration for one shell process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub registry: RegistryConfig,
    pub loader: LoaderConfig,
    pub cache: AssetCacheConfig,
    pub event_capacity: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            loader: LoaderConfig::default(),
            cache: AssetCacheConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ShellConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if Version::parse(&self.loader.framework_version).is_none() {
            return Err(ConfigError::Invalid(format!(
                "loader.framework_version is not a semver version: {}",
                self.loader.framework_version
            )));
        }
        let fraction = self.cache.eviction_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "cache.eviction_fraction must be in (0, 1], got {fraction}"
            )));
        }
        if self.cache.max_resident_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_resident_bytes must be positive".to_string(),
            ));
        }
        if self.cache.base_delay_ms > self.cache.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "cache.base_delay_ms ({}) exceeds cache.max_delay_ms ({})",
                self.cache.base_delay_ms, self.cache.max_delay_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "config is not valid JSON: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}
