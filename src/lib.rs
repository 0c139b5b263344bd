//! # Blob Datastore
//!
//! A key-value datastore stored in object storage. Every key is an object in
//! a bucket; values are the object bytes. Buckets are opened by URL and can be
//! in memory, a local directory, S3, or any backend an application registers.
//!
//! ## Features
//!
//! - **Key Module**: Hierarchical, cleaned keys (`/a/b/c`)
//! - **Bucket Module**: The object storage contract plus memory, filesystem, S3 and GCS buckets
//! - **Query Module**: Queries with prefix, offset, limit, filters and orders
//! - **Datastore Module**: The key-value adapter over a bucket
//!
//! ## Optional Features
//!
//! - `s3`: AWS S3 bucket backend
//! - `gcs`: Google Cloud Storage bucket backend
//! - `serde_support`: Serde serialization support (enabled by default)
//!
//! ## Example
//!
//! ```rust
//! use blob_datastore::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let store = BlobDatastore::open("mem://", DatastoreConfig::default()).await?;
//! store.put(&Key::new("/hello"), b"world").await?;
//! assert!(store.has(&Key::new("/hello")).await?);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core error types
pub use error::{Error, Result};

// Core modules
pub mod bucket;
pub mod config;
pub mod datastore;
pub mod error;
pub mod key;
pub mod query;

pub use datastore::{BlobDatastore, Datastore};

// Re-export commonly used types
pub mod prelude {
    //! Common types and traits for convenient importing

    pub use crate::bucket::{Bucket, BucketRegistry, MemoryBucket};
    pub use crate::config::{DatastoreConfig, QueryMode};
    pub use crate::datastore::{BlobDatastore, Datastore};
    pub use crate::error::{BucketError, DatastoreError, Error, Result};
    pub use crate::key::Key;
    pub use crate::query::{Entry, Filter, Order, Query, Results};
}

// Version information
/// The version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The name of this crate
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
        assert_eq!(CRATE_NAME, "blob-datastore");
    }
}
