//! Google Cloud Storage bucket implementation
//!
//! Built on the `object_store` crate:
//! - Object names drop their leading `/` on the way in and get it back when listed
//! - Path segments are stored percent-encoded where `object_store` requires it
//! - Writes are buffered and uploaded with a single `put` on close
//! - Listings push the directory part of the prefix down to the service and
//!   filter the rest locally

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::{debug, trace};

use crate::bucket::{
    fold_listing, Bucket, BucketOpener, BucketUrl, ListIterator, ListObject, ListOptions,
    ObjectAttributes, ObjectReader, ObjectWriter,
};
use crate::error::{BucketError, BucketResult};

/// GCS bucket, backing `gs://` URLs
#[derive(Debug, Clone)]
pub struct GcsBucket {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    closed: Arc<AtomicBool>,
}

impl GcsBucket {
    /// Open `bucket` authenticating with a service account key in JSON form
    pub fn with_credentials(bucket: &str, service_account_json: &str) -> BucketResult<Self> {
        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(bucket)
            .with_service_account_key(service_account_json)
            .build()
            .map_err(|e| BucketError::operation("open_gcs", e))?;
        Ok(Self::from_store(Arc::new(store), bucket))
    }

    /// Wrap an already built object store
    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        debug!(bucket = %bucket, "opened gcs bucket");
        Self {
            store,
            bucket,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name of the GCS bucket
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn check_open(&self) -> BucketResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BucketError::Closed);
        }
        Ok(())
    }
}

fn object_path(name: &str) -> Path {
    Path::from(name.strip_prefix('/').unwrap_or(name))
}

fn object_name(path: &Path) -> String {
    let parts: Vec<String> = path
        .parts()
        .map(|part| {
            let encoded = part.as_ref();
            urlencoding::decode(encoded).map_or_else(|_| encoded.to_string(), Cow::into_owned)
        })
        .collect();
    format!("/{}", parts.join("/"))
}

fn store_error(operation: &str, name: &str, error: object_store::Error) -> BucketError {
    match error {
        object_store::Error::NotFound { .. } => BucketError::NotFound {
            name: name.to_string(),
        },
        e => BucketError::operation(operation, e),
    }
}

/// Directory part of a raw prefix, which the service can match segment-wise
fn listing_root(prefix: &str) -> Option<Path> {
    let trimmed = prefix.strip_prefix('/').unwrap_or(prefix);
    match trimmed.rfind('/') {
        Some(end) if end > 0 => Some(Path::from(&trimmed[..end])),
        _ => None,
    }
}

#[async_trait]
impl Bucket for GcsBucket {
    async fn exists(&self, name: &str) -> BucketResult<bool> {
        match self.attributes(name).await {
            Ok(_) => Ok(true),
            Err(BucketError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn attributes(&self, name: &str) -> BucketResult<ObjectAttributes> {
        self.check_open()?;
        let meta = self
            .store
            .head(&object_path(name))
            .await
            .map_err(|e| store_error("head_object", name, e))?;

        Ok(ObjectAttributes {
            size: meta.size as u64,
            mod_time: Some(meta.last_modified),
            etag: meta.e_tag,
            content_type: None,
        })
    }

    async fn new_reader(&self, name: &str) -> BucketResult<ObjectReader> {
        self.check_open()?;
        let data = self
            .store
            .get(&object_path(name))
            .await
            .map_err(|e| store_error("get_object", name, e))?
            .bytes()
            .await
            .map_err(|e| store_error("read_object", name, e))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn new_writer(&self, name: &str) -> BucketResult<Box<dyn ObjectWriter>> {
        self.check_open()?;
        Ok(Box::new(GcsWriter {
            bucket: self.clone(),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, name: &str) -> BucketResult<()> {
        // the service treats deleting a missing object as success
        self.attributes(name).await?;

        self.store
            .delete(&object_path(name))
            .await
            .map_err(|e| store_error("delete_object", name, e))
    }

    fn list(&self, options: ListOptions) -> ListIterator {
        if let Err(e) = self.check_open() {
            return ListIterator::failed(e);
        }

        let root = listing_root(&options.prefix);
        let prefix = options.prefix;
        let matching = prefix.clone();
        let listed = self
            .store
            .list(root.as_ref())
            .map(|meta| {
                meta.map(|meta| (object_name(&meta.location), meta.size as u64))
                    .map_err(|e| BucketError::operation("list_objects", e))
            })
            .try_filter(move |(name, _)| futures::future::ready(name.starts_with(&matching)));

        let Some(delimiter) = options.delimiter.filter(|d| !d.is_empty()) else {
            return ListIterator::new(listed.map_ok(|(name, size)| ListObject::object(name, size)));
        };

        // folding needs the listing in name order
        let folded = stream::once(async move {
            let collected: BucketResult<Vec<(String, u64)>> = listed.try_collect().await;
            match collected {
                Ok(mut objects) => {
                    objects.sort();
                    trace!(count = objects.len(), "folding gcs listing");
                    let entries = fold_listing(objects, &prefix, Some(delimiter.as_str()));
                    stream::iter(entries.into_iter().map(Ok)).boxed()
                }
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            }
        })
        .flatten();
        ListIterator::new(folded)
    }

    async fn close(&self) -> BucketResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn scheme(&self) -> &'static str {
        "gs"
    }
}

struct GcsWriter {
    bucket: GcsBucket,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for GcsWriter {
    async fn write(&mut self, buf: &[u8]) -> BucketResult<()> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> BucketResult<()> {
        let GcsWriter {
            bucket,
            name,
            buffer,
        } = *self;
        bucket.check_open()?;
        bucket
            .store
            .put(&object_path(&name), Bytes::from(buffer).into())
            .await
            .map_err(|e| store_error("put_object", &name, e))?;
        Ok(())
    }
}

/// Opener for `gs://bucket?credentials=/path/to/key.json`.
///
/// Without `credentials` the usual `GOOGLE_*` environment variables apply.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcsOpener;

#[async_trait]
impl BucketOpener for GcsOpener {
    async fn open(&self, url: &BucketUrl) -> BucketResult<Arc<dyn Bucket>> {
        if url.bucket().is_empty() {
            return Err(BucketError::InvalidUrl {
                url: url.to_string(),
                reason: "missing bucket name".to_string(),
            });
        }

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(url.bucket());
        if let Some(path) = url.param("credentials") {
            builder = builder.with_service_account_path(path);
        }
        let store = builder
            .build()
            .map_err(|e| BucketError::operation("open_gcs", e))?;
        Ok(Arc::new(GcsBucket::from_store(Arc::new(store), url.bucket())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tokio::io::AsyncReadExt;

    fn bucket() -> (GcsBucket, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        (GcsBucket::from_store(store.clone(), "test-bucket"), store)
    }

    async fn put(bucket: &GcsBucket, name: &str, data: &[u8]) {
        let mut writer = bucket.new_writer(name).await.unwrap();
        writer.write(data).await.unwrap();
        writer.close().await.unwrap();
    }

    async fn names(bucket: &GcsBucket, options: ListOptions) -> Vec<(String, bool)> {
        let mut listing = bucket.list(options);
        let mut names = Vec::new();
        while let Some(object) = listing.next().await.unwrap() {
            names.push((object.key, object.is_dir));
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_round_trip_strips_leading_slash() {
        let (bucket, store) = bucket();
        put(&bucket, "/blocks/abc", b"payload").await;

        assert!(store.head(&Path::from("blocks/abc")).await.is_ok());
        assert!(bucket.exists("/blocks/abc").await.unwrap());
        assert_eq!(bucket.attributes("/blocks/abc").await.unwrap().size, 7);

        let mut data = Vec::new();
        bucket
            .new_reader("/blocks/abc")
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"payload");
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let (bucket, _) = bucket();
        assert!(!bucket.exists("/nope").await.unwrap());
        assert!(bucket.attributes("/nope").await.unwrap_err().is_not_found());
        assert!(bucket.new_reader("/nope").await.err().unwrap().is_not_found());
        assert!(bucket.delete("/nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let (bucket, _) = bucket();
        put(&bucket, "/k", b"first").await;
        put(&bucket, "/k", b"second value").await;
        assert_eq!(bucket.attributes("/k").await.unwrap().size, 12);

        bucket.delete("/k").await.unwrap();
        assert!(!bucket.exists("/k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_restores_names() {
        let (bucket, _) = bucket();
        for name in ["/a/1", "/a/2", "/ab", "/odd/with space/and%percent", "/b"] {
            put(&bucket, name, b"x").await;
        }

        let all = names(&bucket, ListOptions::default()).await;
        assert_eq!(all.len(), 5);
        assert!(all.contains(&("/odd/with space/and%percent".to_string(), false)));

        // prefixes are plain string prefixes, not path segments
        let under_a = names(&bucket, ListOptions::with_prefix("/a")).await;
        let keys: Vec<&str> = under_a.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/a/1", "/a/2", "/ab"]);

        let under_dir = names(&bucket, ListOptions::with_prefix("/a/")).await;
        assert_eq!(under_dir.len(), 2);
    }

    #[tokio::test]
    async fn test_list_with_delimiter_folds_directories() {
        let (bucket, _) = bucket();
        for name in ["/a/1", "/a/2", "/b/1", "/c"] {
            put(&bucket, name, b"x").await;
        }

        let options = ListOptions {
            prefix: "/".to_string(),
            delimiter: Some("/".to_string()),
            page_size: None,
        };
        let listed = names(&bucket, options).await;
        assert_eq!(
            listed,
            vec![
                ("/a/".to_string(), true),
                ("/b/".to_string(), true),
                ("/c".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_bucket() {
        let (bucket, _) = bucket();
        put(&bucket, "/k", b"v").await;
        bucket.close().await.unwrap();

        assert!(matches!(bucket.exists("/k").await, Err(BucketError::Closed)));
        assert!(matches!(bucket.new_writer("/k").await.err(), Some(BucketError::Closed)));
        let mut listing = bucket.list(ListOptions::default());
        assert!(matches!(listing.next().await, Err(BucketError::Closed)));
    }

    #[tokio::test]
    async fn test_open_requires_bucket_name() {
        let url = BucketUrl::parse("gs://?credentials=/tmp/key.json").unwrap();
        let err = GcsOpener.open(&url).await.err().unwrap();
        assert!(matches!(err, BucketError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_datastore_over_gcs() {
        use crate::config::DatastoreConfig;
        use crate::datastore::{BlobDatastore, Datastore};
        use crate::key::Key;
        use crate::query::Query;

        let (bucket, _) = bucket();
        let store = BlobDatastore::with_bucket(Arc::new(bucket), "test-bucket", DatastoreConfig::default());
        for k in ["/q/1", "/q/2", "/r/1"] {
            store.put(&Key::new(k), k.as_bytes()).await.unwrap();
        }
        assert_eq!(store.get(&Key::new("/q/2")).await.unwrap().as_ref(), b"/q/2");

        let entries = store.query(Query::with_prefix("/q/")).await.unwrap().rest().await.unwrap();
        let mut keys: Vec<String> = entries.into_iter().map(|e| e.key).collect();
        keys.sort();
        assert_eq!(keys, vec!["/q/1", "/q/2"]);
    }

    #[test]
    fn test_bad_service_account_key() {
        use crate::config::DatastoreConfig;
        use crate::datastore::BlobDatastore;

        let err = BlobDatastore::new_gcs_with_credentials("b", "not json", DatastoreConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Bucket(BucketError::OperationFailed { .. })
        ));
    }

    #[test]
    fn test_listing_root() {
        assert_eq!(listing_root(""), None);
        assert_eq!(listing_root("/"), None);
        assert_eq!(listing_root("/a"), None);
        assert_eq!(listing_root("/a/"), Some(Path::from("a")));
        assert_eq!(listing_root("/a/b/c"), Some(Path::from("a/b")));
    }
}
