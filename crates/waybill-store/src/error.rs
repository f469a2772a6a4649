//! Error types for waybill-store
//!
//! This module defines the error types used throughout the storage crate.

use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Persistent storage could not be opened at all.
    ///
    /// Fatal for the session; callers should fall back to an
    /// online-only mode without a local cache.
    #[error("local store unavailable: {0}")]
    Unavailable(String),

    /// Database error during an individual operation
    #[error("database error: {0}")]
    Database(String),

    /// Error during serialization
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A record is missing the key field its collection requires
    #[error("record in '{collection}' is missing key field '{key_field}'")]
    MissingKey {
        collection: String,
        key_field: String,
    },

    /// The collection is not declared in the store schema
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The index is not declared for the collection
    #[error("unknown index '{index}' on collection '{collection}'")]
    UnknownIndex { collection: String, index: String },

    /// The on-disk schema version is newer than this build supports
    #[error("store schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: u64, supported: u64 },
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl StoreError {
    /// Create a new Unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create a new Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_error() {
        let err = StoreError::unavailable("storage denied");
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.to_string().contains("storage denied"));
    }

    #[test]
    fn test_missing_key_error() {
        let err = StoreError::MissingKey {
            collection: "packages".to_string(),
            key_field: "id".to_string(),
        };
        assert!(err.to_string().contains("packages"));
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();
        assert!(matches!(store_err, StoreError::Database(_)));
    }

    #[test]
    fn test_schema_version_error() {
        let err = StoreError::SchemaVersion {
            found: 9,
            supported: 1,
        };
        assert!(err.to_string().contains('9'));
    }
}
