//! Error types for cache operations
//!
//! Backends report failures through [`CacheError`]. The manager never lets
//! these reach its callers: caching is advisory, so every error is logged and
//! degraded into a miss or a dropped write.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// A storage tier could not be opened during probing
    #[error("Backend unavailable ({backend}): {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// A write did not fit into the backend's capacity, even after eviction
    #[error("Quota exceeded: needed {needed} bytes, capacity is {capacity} bytes")]
    QuotaExceeded { needed: u64, capacity: u64 },

    /// Stored payload no longer matches its integrity hash
    #[error("Integrity check failed for key: {key}")]
    IntegrityFailure { key: String },

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage engine error (transactions, cursors, map access)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<heed::Error> for CacheError {
    fn from(e: heed::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl CacheError {
    /// Whether the error means the backend ran out of room
    pub fn is_quota(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }
}
