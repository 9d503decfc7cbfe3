//! Error types for identity resolution and the membership cache

use crate::types::KeyType;
use thiserror::Error;

/// Identity cache errors
///
/// `Clone` so a single directory fallback can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdCacheError {
    /// The directory authoritatively has no such identity
    #[error("Identity not found")]
    NotFound,

    /// Directory partition cannot be reached
    #[error("Directory partition unavailable: {partition}")]
    Unavailable { partition: String },

    /// Key failed to parse for its key type
    #[error("Malformed key: {0}")]
    Malformed(String),

    /// Two non-reserved records collided on one index key
    #[error("Conflicting {key_type} entry for key {key}")]
    Conflict { key_type: KeyType, key: String },

    /// No temporary numeric ids left to hand out
    #[error("Temporary id space exhausted")]
    TemporaryIdsExhausted,

    /// Directory collaborator failure
    #[error("Directory error: {0}")]
    Directory(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IdCacheError {
    /// Whether the failure says anything about the key's existence
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Result type for identity cache operations
pub type Result<T> = std::result::Result<T, IdCacheError>;
