//! Shared helpers for integration tests

use std::sync::Arc;

use blob_datastore::bucket::{Bucket, FileBucket, MemoryBucket};
use blob_datastore::prelude::*;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A datastore over a fresh bucket of the given kind.
///
/// The returned `TempDir` (if any) must outlive the datastore.
pub fn datastore(kind: &str, mode: QueryMode) -> (BlobDatastore, Option<TempDir>) {
    init_tracing();
    let config = DatastoreConfig::with_query_mode(mode);
    match kind {
        "mem" => {
            let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new());
            (BlobDatastore::with_bucket(bucket, "mem", config), None)
        }
        "file" => {
            let temp_dir = TempDir::new().unwrap();
            let bucket: Arc<dyn Bucket> = Arc::new(FileBucket::open(temp_dir.path()).unwrap());
            (BlobDatastore::with_bucket(bucket, "file", config), Some(temp_dir))
        }
        other => panic!("unknown bucket kind {other}"),
    }
}

pub const KINDS: [&str; 2] = ["mem", "file"];
