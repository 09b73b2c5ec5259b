//! LakeMeta Common - Shared types and utilities
//!
//! This crate provides the entity kinds, name paths, error definitions and
//! configuration used by the LakeMeta storage backend and its consumers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{KvConfig, MappingConfig, StoreConfig, TransactionConfig};
pub use error::{Error, Result};
pub use types::*;
