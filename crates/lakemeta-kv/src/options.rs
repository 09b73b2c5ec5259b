//! Engine tuning options for the ordered byte store.
//!
//! Options arrive as a string-keyed map (the `kv.options.*` section of the
//! service configuration) and must be applied before the store is opened.

use lakemeta_common::{Error, Result};
use std::collections::HashMap;
use tracing::warn;

/// Page cache size of the engine, in bytes
pub const CACHE_SIZE_BYTES: &str = "cache-size-bytes";
/// Commit durability: `immediate`, `eventual` or `none`
pub const DURABILITY: &str = "durability";
/// Compact the database file once while opening it
pub const COMPACT_ON_OPEN: &str = "compact-on-open";
/// Log progress of crash repair while opening
pub const REPAIR_ON_OPEN_LOG: &str = "repair-on-open-log";

/// When a committed write becomes durable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// fsync before commit returns
    #[default]
    Immediate,
    /// Durable once a later immediate commit happens
    Eventual,
    /// Never explicitly synced; tests and scratch stores only
    None,
}

impl Durability {
    pub(crate) const fn to_redb(self) -> redb::Durability {
        match self {
            Self::Immediate => redb::Durability::Immediate,
            Self::Eventual => redb::Durability::Eventual,
            Self::None => redb::Durability::None,
        }
    }
}

/// Open-time tuning knobs of the embedded engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Page cache size (engine default when unset)
    pub cache_size_bytes: Option<usize>,
    /// Commit durability for every write transaction
    pub durability: Durability,
    /// Compact the file before the store is shared
    pub compact_on_open: bool,
    /// Log repair progress when the file was not closed cleanly
    pub repair_on_open_log: bool,
}

impl StoreOptions {
    /// Build options from a string map on top of the defaults
    pub fn from_map(options: &HashMap<String, String>) -> Result<Self> {
        let mut result = Self::default();
        result.configure(options)?;
        Ok(result)
    }

    /// Apply every recognised key of `options`.
    ///
    /// Unknown keys are logged and skipped so that options meant for other
    /// engines do not prevent startup.
    pub fn configure(&mut self, options: &HashMap<String, String>) -> Result<()> {
        for (key, value) in options {
            let value = value.trim();
            match key.as_str() {
                CACHE_SIZE_BYTES => {
                    let bytes = value.parse::<usize>().map_err(|_| invalid(key, value))?;
                    self.cache_size_bytes = Some(bytes);
                }
                DURABILITY => {
                    self.durability = match value.to_ascii_lowercase().as_str() {
                        "immediate" => Durability::Immediate,
                        "eventual" => Durability::Eventual,
                        "none" => Durability::None,
                        _ => return Err(invalid(key, value)),
                    };
                }
                COMPACT_ON_OPEN => self.compact_on_open = parse_bool(key, value)?,
                REPAIR_ON_OPEN_LOG => self.repair_on_open_log = parse_bool(key, value)?,
                _ => warn!("Ignoring unknown store option '{}'", key),
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::configuration(format!("invalid value '{value}' for store option '{key}'"))
}
