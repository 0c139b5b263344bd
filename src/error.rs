//! Error types for the blob datastore
//!
//! This module provides a unified error handling system using `thiserror` for
//! the bucket layer and the key-value adapter built on top of it.

use thiserror::Error;

/// The main error type for the blob datastore crate
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value adapter errors
    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    /// Bucket (object storage) errors
    #[error("Bucket error: {0}")]
    Bucket(#[from] BucketError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },
}

/// Bucket-specific error types
///
/// `NotFound` is the one code the adapter interprets; everything else is
/// passed through to the caller as-is.
#[derive(Error, Debug)]
pub enum BucketError {
    /// Object does not exist
    #[error("Object not found: {name}")]
    NotFound {
        /// Object name
        name: String,
    },

    /// Backend operation failed
    #[error("Bucket operation failed: {operation}: {reason}")]
    OperationFailed {
        /// Bucket call that failed
        operation: String,
        /// Backend message
        reason: String,
    },

    /// The bucket handle has been closed
    #[error("Bucket has been closed")]
    Closed,

    /// No opener is registered for the URL scheme
    #[error("Unsupported bucket scheme: {scheme}")]
    UnsupportedScheme {
        /// URL scheme
        scheme: String,
    },

    /// The bucket URL could not be parsed
    #[error("Invalid bucket URL {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Why parsing failed
        reason: String,
    },

    /// Backend compiled out or otherwise unavailable
    #[error("Bucket backend not available: {backend}")]
    BackendNotAvailable {
        /// Backend name
        backend: String,
    },

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BucketError {
    /// Shorthand for [`BucketError::OperationFailed`]
    pub fn operation(operation: &str, reason: impl std::fmt::Display) -> Self {
        BucketError::OperationFailed {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is the backend's not-found code
    pub fn is_not_found(&self) -> bool {
        matches!(self, BucketError::NotFound { .. })
    }
}

/// Key-value adapter error types
#[derive(Error, Debug)]
pub enum DatastoreError {
    /// No value is stored under the key
    #[error("datastore: key not found: {key}")]
    NotFound {
        /// The missing key
        key: String,
    },

    /// The query shape cannot be served by the configured query mode
    #[error("datastore: unsupported query: {reason}")]
    UnsupportedQuery {
        /// Which clause cannot be served
        reason: String,
    },

    /// Any other backend failure, surfaced unchanged
    #[error(transparent)]
    Bucket(#[from] BucketError),
}

impl DatastoreError {
    /// Whether this is the normalized not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatastoreError::NotFound { .. })
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, Error>;

/// Convenience type alias for Bucket Results
pub type BucketResult<T> = std::result::Result<T, BucketError>;

/// Convenience type alias for Datastore Results
pub type DatastoreResult<T> = std::result::Result<T, DatastoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let bucket_error = BucketError::NotFound {
            name: "/a/b".to_string(),
        };
        let error = Error::Bucket(bucket_error);
        assert!(error.to_string().contains("Bucket error"));
        assert!(error.to_string().contains("/a/b"));
    }

    #[test]
    fn test_bucket_error_passes_through_transparently() {
        let inner = BucketError::operation("list", "throttled");
        let message = inner.to_string();
        let error = DatastoreError::from(inner);
        assert_eq!(error.to_string(), message);
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_not_found_helpers() {
        assert!(BucketError::NotFound { name: "x".into() }.is_not_found());
        assert!(!BucketError::Closed.is_not_found());
        assert!(DatastoreError::NotFound { key: "/x".into() }.is_not_found());
    }
}
