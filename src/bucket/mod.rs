//! Bucket module: the object storage contract consumed by the datastore
//!
//! A bucket is a flat namespace of named, opaque byte objects. This module
//! defines the trait every backend implements plus the types that flow across
//! it:
//! - **In-memory buckets** - For tests and ephemeral stores (`mem://`)
//! - **Local filesystem buckets** - Objects as files under a base directory (`file://`)
//! - **AWS S3 buckets** - Cloud object storage (optional, requires `s3` feature)
//! - **Google Cloud Storage buckets** - Through `object_store` (optional, requires `gcs` feature)
//!
//! Backends are opened by URL through a [`BucketRegistry`], which maps URL
//! schemes to openers. Applications can register their own schemes (for
//! example `azblob`) next to the built-in ones.
//!
//! # Examples
//!
//! ```rust
//! use blob_datastore::bucket::{Bucket, MemoryBucket};
//! use tokio::io::AsyncReadExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bucket = MemoryBucket::new();
//!
//! let mut writer = bucket.new_writer("/greeting").await?;
//! writer.write(b"Hello, World!").await?;
//! writer.close().await?;
//!
//! let mut data = Vec::new();
//! bucket.new_reader("/greeting").await?.read_to_end(&mut data).await?;
//! assert_eq!(data, b"Hello, World!");
//! assert_eq!(bucket.attributes("/greeting").await?.size, 13);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "gcs")]
pub mod gcs;
pub mod local;
pub mod memory;
pub mod registry;

#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "gcs")]
pub use gcs::{GcsBucket, GcsOpener};
pub use local::{FileBucket, LocalConfig};
pub use memory::MemoryBucket;
pub use registry::{BucketOpener, BucketRegistry, BucketUrl};

#[cfg(feature = "s3")]
pub use s3::{S3Bucket, S3Config};

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::AsyncRead;

use crate::error::BucketResult;

/// Readable object body; dropping it releases the underlying resource
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Attributes of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectAttributes {
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub mod_time: Option<chrono::DateTime<chrono::Utc>>,
    /// ETag or content hash, when the backend has one
    pub etag: Option<String>,
    /// Content type, when the backend records one
    pub content_type: Option<String>,
}

/// One entry produced by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObject {
    /// Object name, or the folded prefix for directory entries
    pub key: String,
    /// Object size in bytes, zero for directory entries
    pub size: u64,
    /// Whether this entry is a delimiter-folded pseudo-directory
    pub is_dir: bool,
}

impl ListObject {
    /// A regular object entry
    pub fn object(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            is_dir: false,
        }
    }

    /// A pseudo-directory entry
    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            is_dir: true,
        }
    }
}

/// Options for [`Bucket::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only names starting with this string are listed
    pub prefix: String,
    /// Fold names sharing a prefix up to this delimiter into one directory entry
    pub delimiter: Option<String>,
    /// Page size hint for paginated backends
    pub page_size: Option<usize>,
}

impl ListOptions {
    /// List everything under `prefix`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }
}

/// Iterator over a bucket listing.
///
/// Backends may fetch pages lazily; the iterator owns whatever it needs and
/// does not borrow from the bucket.
pub struct ListIterator {
    inner: BoxStream<'static, BucketResult<ListObject>>,
}

impl ListIterator {
    /// Wrap an arbitrary stream of list results
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = BucketResult<ListObject>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// Iterator over an already materialized listing
    pub fn from_objects(objects: Vec<ListObject>) -> Self {
        Self::new(stream::iter(objects.into_iter().map(Ok)))
    }

    /// Iterator whose first item is `error`
    pub fn failed(error: crate::error::BucketError) -> Self {
        Self::new(stream::once(async move { Err(error) }))
    }

    /// Next listed object, `Ok(None)` once the listing is exhausted
    pub async fn next(&mut self) -> BucketResult<Option<ListObject>> {
        self.inner.next().await.transpose()
    }
}

impl Stream for ListIterator {
    type Item = BucketResult<ListObject>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ListIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListIterator").finish_non_exhaustive()
    }
}

/// Sink for a new object; nothing is visible until [`ObjectWriter::close`]
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append bytes to the pending object
    async fn write(&mut self, buf: &[u8]) -> BucketResult<()>;

    /// Commit the object
    async fn close(self: Box<Self>) -> BucketResult<()>;
}

/// Object storage contract
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    /// Whether an object named `name` exists
    async fn exists(&self, name: &str) -> BucketResult<bool>;

    /// Object attributes; `NotFound` if missing
    async fn attributes(&self, name: &str) -> BucketResult<ObjectAttributes>;

    /// Open the object for reading; `NotFound` if missing
    async fn new_reader(&self, name: &str) -> BucketResult<ObjectReader>;

    /// Open a writer that creates or replaces the object on close
    async fn new_writer(&self, name: &str) -> BucketResult<Box<dyn ObjectWriter>>;

    /// Remove the object; `NotFound` if missing
    async fn delete(&self, name: &str) -> BucketResult<()>;

    /// List objects matching `options`
    fn list(&self, options: ListOptions) -> ListIterator;

    /// Release the handle; later calls fail with `Closed`
    async fn close(&self) -> BucketResult<()>;

    /// URL scheme this bucket was opened under
    fn scheme(&self) -> &'static str;
}

/// Turn a sorted `(name, size)` listing into list entries, applying the
/// prefix and optional delimiter folding.
pub(crate) fn fold_listing<I>(objects: I, prefix: &str, delimiter: Option<&str>) -> Vec<ListObject>
where
    I: IntoIterator<Item = (String, u64)>,
{
    let mut listed: Vec<ListObject> = Vec::new();

    for (name, size) in objects {
        if !name.starts_with(prefix) {
            continue;
        }

        let folded = delimiter
            .filter(|d| !d.is_empty())
            .and_then(|d| name[prefix.len()..].find(d).map(|pos| prefix.len() + pos + d.len()));

        match folded {
            Some(end) => {
                let dir = &name[..end];
                // names sharing a folded prefix are contiguous once sorted
                if listed.last().map(|last| last.is_dir && last.key == dir) != Some(true) {
                    listed.push(ListObject::dir(dir));
                }
            }
            None => listed.push(ListObject::object(name, size)),
        }
    }

    listed
}
