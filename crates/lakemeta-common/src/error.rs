//! Error types for LakeMeta
//!
//! This module defines the common error types used throughout the storage
//! backend.

use crate::types::EntityKind;
use thiserror::Error;

/// Common result type for LakeMeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for LakeMeta
#[derive(Debug, Error)]
pub enum Error {
    // Key encoding errors
    #[error("entity kind {kind} cannot be encoded on its own")]
    UnsupportedEntityKind { kind: EntityKind },

    #[error("{kind} requires a namespace of {expected} level(s), got {actual}")]
    InvalidNamespace {
        kind: EntityKind,
        expected: usize,
        actual: usize,
    },

    #[error("corrupt key: {0}")]
    CorruptKey(String),

    // Storage errors
    #[error("storage I/O error: {0}")]
    StorageIo(String),

    #[error("store at {0} is already open")]
    StoreAlreadyOpen(String),

    #[error("corrupt value: {0}")]
    CorruptValue(String),

    // Transaction id errors
    #[error(
        "clock skew exceeded: transaction ids at {persisted_ms} ms, wall clock at {current_ms} ms, \
         tolerance {max_skew_ms} ms"
    )]
    ClockSkewExceeded {
        persisted_ms: u64,
        current_ms: u64,
        max_skew_ms: u64,
    },

    #[error("transaction id generator is not running")]
    GeneratorNotRunning,

    // Entity errors
    #[error("no such entity: {0}")]
    NoSuchEntity(String),

    #[error("entity already exists: {0}")]
    EntityAlreadyExists(String),

    #[error("entity {0} still has sub-entities")]
    NonEmptyEntity(String),

    #[error("name already mapped: {0}")]
    NameAlreadyMapped(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage I/O error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageIo(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageIo(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchEntity(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::StorageIo(e.to_string())
    }
}
