//! Error types for Cairn operations

use thiserror::Error;

/// Identity keying errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyingError {
    #[error("Unresolved type reference: {type_ref}")]
    UnresolvedType { type_ref: String },

    #[error("Entity of type {entity_type} has no identity assigned")]
    MissingIdentity { entity_type: String },
}

/// Cache backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache backend {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid dsn: {dsn} - {reason}")]
    InvalidDsn { dsn: String, reason: String },

    #[error("Unknown cache client: {client}")]
    UnknownClient { client: String },

    #[error("Provider not supported: {provider}")]
    ProviderNotSupported { provider: String },
}

/// Master error type for all Cairn errors.
#[derive(Debug, Clone, Error)]
pub enum CairnError {
    #[error("Keying error: {0}")]
    Keying(#[from] KeyingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CairnError {
    /// Whether this error means the cache backend could not be reached.
    ///
    /// Callers use this to decide between degrading to uncached reads and
    /// aborting.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CairnError::Storage(StorageError::Unavailable { .. }))
    }
}

/// Result type alias for Cairn operations.
pub type CairnResult<T> = Result<T, CairnError>;

// =============================================================================
// TESTS
// =============================================================================
