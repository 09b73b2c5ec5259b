//! Configuration types for the LakeMeta KV backend
//!
//! The surrounding service hands configuration over as a flat string-keyed
//! map. [`KvConfig::from_map`] turns that map into typed sections with
//! defaults for every missing key.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Prefix shared by every key this backend understands
pub const CONFIG_PREFIX: &str = "lakemeta.entity.store.";

/// Key of the store directory
pub const KV_PATH: &str = "lakemeta.entity.store.kv.path";
/// Prefix of engine tuning options forwarded to the byte store
pub const KV_OPTIONS_PREFIX: &str = "lakemeta.entity.store.kv.options.";
/// Maximum tolerated wall-clock regression in milliseconds
pub const TXN_MAX_SKEW_MS: &str = "lakemeta.entity.store.transaction.max-skew-ms";
/// Interval of the high-water mark flush in milliseconds
pub const TXN_FLUSH_INTERVAL_MS: &str = "lakemeta.entity.store.transaction.flush-interval-ms";
/// How long startup waits for a lagging clock in milliseconds
pub const TXN_STARTUP_WAIT_MS: &str = "lakemeta.entity.store.transaction.startup-wait-ms";
/// Capacity of the name mapping cache
pub const MAPPING_CACHE_CAPACITY: &str = "lakemeta.entity.store.mapping.cache-capacity";
/// Idle time after which cached mappings expire, in seconds
pub const MAPPING_CACHE_IDLE_SECS: &str = "lakemeta.entity.store.mapping.cache-idle-secs";

/// Root configuration for the KV backend
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KvConfig {
    /// Byte store configuration
    pub store: StoreConfig,
    /// Transaction id generator configuration
    pub transaction: TransactionConfig,
    /// Name mapping configuration
    pub mapping: MappingConfig,
}

impl KvConfig {
    /// Build a configuration from a flat string map.
    ///
    /// Keys outside [`CONFIG_PREFIX`] are ignored; unknown keys inside it are
    /// logged. Values that fail to parse are a configuration error.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in map {
            if !key.starts_with(CONFIG_PREFIX) {
                continue;
            }
            if let Some(option) = key.strip_prefix(KV_OPTIONS_PREFIX) {
                config
                    .store
                    .options
                    .insert(option.to_string(), value.clone());
                continue;
            }
            match key.as_str() {
                KV_PATH => config.store.path = PathBuf::from(value),
                TXN_MAX_SKEW_MS => config.transaction.max_skew_ms = parse_value(key, value)?,
                TXN_FLUSH_INTERVAL_MS => {
                    config.transaction.flush_interval_ms = parse_value(key, value)?;
                }
                TXN_STARTUP_WAIT_MS => {
                    config.transaction.startup_wait_ms = parse_value(key, value)?;
                }
                MAPPING_CACHE_CAPACITY => {
                    config.mapping.cache_capacity = parse_value(key, value)?;
                }
                MAPPING_CACHE_IDLE_SECS => {
                    config.mapping.cache_idle_secs = parse_value(key, value)?;
                }
                _ => warn!("Ignoring unknown configuration key '{}'", key),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.transaction.flush_interval_ms == 0 {
            return Err(Error::configuration(format!(
                "{TXN_FLUSH_INTERVAL_MS} must be greater than zero"
            )));
        }
        if self.mapping.cache_capacity == 0 {
            return Err(Error::configuration(format!(
                "{MAPPING_CACHE_CAPACITY} must be greater than zero"
            )));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("invalid value '{value}' for {key}")))
}

/// Embedded byte store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store
    pub path: PathBuf,
    /// Engine tuning options, keyed without the options prefix
    pub options: HashMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/lakemeta/kv"),
            options: HashMap::new(),
        }
    }
}

/// Transaction id generator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Maximum tolerated wall-clock regression (milliseconds)
    pub max_skew_ms: u64,
    /// High-water mark flush interval (milliseconds)
    pub flush_interval_ms: u64,
    /// Startup wait for a lagging clock (milliseconds)
    pub startup_wait_ms: u64,
}

impl TransactionConfig {
    #[must_use]
    pub const fn max_skew(&self) -> Duration {
        Duration::from_millis(self.max_skew_ms)
    }

    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub const fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_skew_ms: 2000,
            flush_interval_ms: 1000,
            startup_wait_ms: 5000,
        }
    }
}

/// Name mapping configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Maximum number of cached name to id entries
    pub cache_capacity: usize,
    /// Idle time before a cached entry expires (seconds)
    pub cache_idle_secs: u64,
}

impl MappingConfig {
    #[must_use]
    pub const fn cache_idle(&self) -> Duration {
        Duration::from_secs(self.cache_idle_secs)
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_idle_secs: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = KvConfig::default();
        assert_eq!(config.store.path, PathBuf::from("/var/lib/lakemeta/kv"));
        assert_eq!(config.transaction.max_skew(), Duration::from_secs(2));
        assert_eq!(config.mapping.cache_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_map() {
        let config = KvConfig::from_map(&map(&[
            (KV_PATH, "/tmp/lakemeta"),
            (TXN_MAX_SKEW_MS, "500"),
            (TXN_FLUSH_INTERVAL_MS, " 250 "),
            (MAPPING_CACHE_CAPACITY, "16"),
            ("lakemeta.entity.store.kv.options.cache-size-bytes", "1048576"),
            ("unrelated.key", "ignored"),
        ]))
        .unwrap();

        assert_eq!(config.store.path, PathBuf::from("/tmp/lakemeta"));
        assert_eq!(config.transaction.max_skew_ms, 500);
        assert_eq!(config.transaction.flush_interval(), Duration::from_millis(250));
        assert_eq!(config.transaction.startup_wait_ms, 5000);
        assert_eq!(config.mapping.cache_capacity, 16);
        assert_eq!(
            config.store.options.get("cache-size-bytes").map(String::as_str),
            Some("1048576")
        );
    }

    #[test]
    fn test_from_map_rejects_bad_values() {
        let err = KvConfig::from_map(&map(&[(TXN_MAX_SKEW_MS, "soon")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = KvConfig::from_map(&map(&[(TXN_FLUSH_INTERVAL_MS, "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
