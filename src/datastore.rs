//! Key-value datastore over a bucket
//!
//! [`BlobDatastore`] maps every [`Key`] to the bucket object with the same
//! name and implements [`Datastore`] on top of the [`Bucket`] contract. It
//! holds no cache and no locks; all state lives in the bucket.
//!
//! # Examples
//!
//! ```rust
//! use blob_datastore::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let store = BlobDatastore::open("mem://", DatastoreConfig::default()).await?;
//!
//! store.put(&Key::new("/a/1"), b"one").await?;
//! assert_eq!(store.get(&Key::new("/a/1")).await?.as_ref(), b"one");
//! assert_eq!(store.get_size(&Key::new("/a/1")).await?, 3);
//!
//! let entries = store.query(Query::with_prefix("/a/")).await?.rest().await?;
//! assert_eq!(entries.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::bucket::{Bucket, BucketRegistry, BucketUrl, ListObject, ListOptions};
use crate::config::{DatastoreConfig, QueryMode};
use crate::error::{BucketError, DatastoreError, DatastoreResult};
use crate::key::Key;
use crate::query::naive::{self, ResultStream};
use crate::query::{self, Entry, Query, QueryResult, Results};

/// Key-value store contract
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Whether a value is stored under `key`
    async fn has(&self, key: &Key) -> DatastoreResult<bool>;

    /// The value stored under `key`
    async fn get(&self, key: &Key) -> DatastoreResult<Bytes>;

    /// Size in bytes of the value stored under `key`
    async fn get_size(&self, key: &Key) -> DatastoreResult<usize>;

    /// Store `value` under `key`, replacing any previous value
    async fn put(&self, key: &Key, value: &[u8]) -> DatastoreResult<()>;

    /// Remove the value under `key`; removing a missing key succeeds
    async fn delete(&self, key: &Key) -> DatastoreResult<()>;

    /// Flush writes under `prefix` to stable storage
    async fn sync(&self, prefix: &Key) -> DatastoreResult<()>;

    /// Run `query`
    async fn query(&self, query: Query) -> DatastoreResult<Results>;

    /// Release the store
    async fn close(&self) -> DatastoreResult<()>;
}

/// [`Datastore`] backed by a [`Bucket`]
#[derive(Debug, Clone)]
pub struct BlobDatastore {
    bucket: Arc<dyn Bucket>,
    bucket_name: String,
    config: DatastoreConfig,
}

impl BlobDatastore {
    /// Open the bucket at `url` through the default registry
    pub async fn open(url: &str, config: DatastoreConfig) -> crate::Result<Self> {
        Self::open_with_registry(&BucketRegistry::default(), url, config).await
    }

    /// Open the bucket at `url` through `registry`
    #[instrument(skip(registry, config))]
    pub async fn open_with_registry(
        registry: &BucketRegistry,
        url: &str,
        config: DatastoreConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        let parsed = BucketUrl::parse(url)?;
        let bucket = registry.open(url).await?;
        let name = match parsed.bucket() {
            "" => parsed.location(),
            name => name,
        };
        debug!(scheme = bucket.scheme(), bucket = name, "opened datastore");
        Ok(Self::with_bucket(bucket, name, config))
    }

    /// Wrap an already open bucket
    pub fn with_bucket(
        bucket: Arc<dyn Bucket>,
        bucket_name: impl Into<String>,
        config: DatastoreConfig,
    ) -> Self {
        Self {
            bucket,
            bucket_name: bucket_name.into(),
            config,
        }
    }

    /// Open S3 bucket `bucket` with credentials and region from `aws_config`
    #[cfg(feature = "s3")]
    pub fn new_s3_with_config(
        bucket: &str,
        aws_config: &aws_config::SdkConfig,
        config: DatastoreConfig,
    ) -> crate::Result<Self> {
        use crate::bucket::{S3Bucket, S3Config};

        config.validate()?;
        let s3_config = S3Config {
            bucket: bucket.to_string(),
            page_size: config.list_page_size,
            ..Default::default()
        };
        let s3 = S3Bucket::from_sdk_config(aws_config, s3_config);
        Ok(Self::with_bucket(Arc::new(s3), bucket, config))
    }

    /// Open GCS bucket `bucket` with a service account key in JSON form
    #[cfg(feature = "gcs")]
    pub fn new_gcs_with_credentials(
        bucket: &str,
        service_account_json: &str,
        config: DatastoreConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        let gcs = crate::bucket::GcsBucket::with_credentials(bucket, service_account_json)?;
        Ok(Self::with_bucket(Arc::new(gcs), bucket, config))
    }

    /// Name of the underlying bucket
    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Datastore configuration
    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    /// The underlying bucket
    pub fn bucket(&self) -> &Arc<dyn Bucket> {
        &self.bucket
    }

    /// Total size in bytes of every object in the bucket
    #[instrument(skip(self), fields(bucket = %self.bucket_name))]
    pub async fn disk_usage(&self) -> DatastoreResult<u64> {
        let mut listing = self.bucket.list(self.list_options(""));
        let mut total = 0u64;
        while let Some(object) = listing.next().await? {
            if !object.is_dir {
                total = total.saturating_add(object.size);
            }
        }
        Ok(total)
    }

    fn list_options(&self, prefix: &str) -> ListOptions {
        ListOptions {
            prefix: prefix.to_string(),
            delimiter: None,
            page_size: Some(self.config.list_page_size),
        }
    }

    fn spawn_strict(&self, query: Query) -> Results {
        let (tx, rx) = mpsc::channel(self.config.result_buffer.max(1));
        let bucket = Arc::clone(&self.bucket);
        let options = self.list_options(&query.prefix);
        let task = tokio::spawn(produce_strict(bucket, options, query.clone(), tx));
        Results::new(query, receiver_stream(rx), Some(task))
    }

    fn spawn_naive(&self, query: Query) -> Results {
        let (tx, rx) = mpsc::channel(self.config.result_buffer.max(1));
        let bucket = Arc::clone(&self.bucket);
        let keys_only = query.keys_only;
        let listed: ResultStream = self
            .bucket
            .list(self.list_options(&query.prefix))
            .filter(|listed| futures::future::ready(!matches!(listed, Ok(object) if object.is_dir)))
            .then(move |listed| {
                let bucket = Arc::clone(&bucket);
                async move {
                    match listed {
                        Ok(object) => load_entry(bucket.as_ref(), object, keys_only, true).await,
                        Err(e) => Err(DatastoreError::from(e)),
                    }
                }
            })
            .boxed();
        let applied = naive::apply(&query, listed);
        let task = tokio::spawn(forward(applied, tx));
        Results::new(query, receiver_stream(rx), Some(task))
    }
}

#[async_trait]
impl Datastore for BlobDatastore {
    #[instrument(skip(self), fields(key = %key))]
    async fn has(&self, key: &Key) -> DatastoreResult<bool> {
        Ok(self.bucket.exists(key.as_str()).await?)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &Key) -> DatastoreResult<Bytes> {
        read_value(self.bucket.as_ref(), key.as_str()).await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_size(&self, key: &Key) -> DatastoreResult<usize> {
        let attributes = self
            .bucket
            .attributes(key.as_str())
            .await
            .map_err(|e| not_found(e, key.as_str()))?;
        Ok(to_usize(attributes.size))
    }

    #[instrument(skip(self, value), fields(key = %key, len = value.len()))]
    async fn put(&self, key: &Key, value: &[u8]) -> DatastoreResult<()> {
        let mut writer = self.bucket.new_writer(key.as_str()).await?;
        if let Err(e) = writer.write(value).await {
            if let Err(close_err) = writer.close().await {
                trace!(error = %close_err, "closing failed writer");
            }
            return Err(e.into());
        }
        writer.close().await?;
        trace!("stored value");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &Key) -> DatastoreResult<()> {
        match self.bucket.delete(key.as_str()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                trace!("delete of missing key");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn sync(&self, _prefix: &Key) -> DatastoreResult<()> {
        // writes are durable once the object writer is closed
        Ok(())
    }

    #[instrument(skip(self), fields(query = %query, mode = ?self.config.query_mode))]
    async fn query(&self, query: Query) -> DatastoreResult<Results> {
        match self.config.query_mode {
            QueryMode::Strict => {
                if query.needs_local_processing() {
                    warn!("rejecting query with filters or orders");
                    return Err(query::unsupported(&query));
                }
                Ok(self.spawn_strict(query))
            }
            QueryMode::Naive => Ok(self.spawn_naive(query)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket_name))]
    async fn close(&self) -> DatastoreResult<()> {
        self.bucket.close().await?;
        debug!("closed datastore");
        Ok(())
    }
}

fn not_found(error: BucketError, key: &str) -> DatastoreError {
    if error.is_not_found() {
        DatastoreError::NotFound {
            key: key.to_string(),
        }
    } else {
        DatastoreError::Bucket(error)
    }
}

fn to_usize(size: u64) -> usize {
    usize::try_from(size).unwrap_or(usize::MAX)
}

async fn read_value(bucket: &dyn Bucket, name: &str) -> DatastoreResult<Bytes> {
    let mut reader = bucket
        .new_reader(name)
        .await
        .map_err(|e| not_found(e, name))?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .await
        .map_err(BucketError::from)?;
    Ok(Bytes::from(data))
}

async fn load_entry(
    bucket: &dyn Bucket,
    object: ListObject,
    keys_only: bool,
    with_size: bool,
) -> QueryResult {
    let value = if keys_only {
        None
    } else {
        Some(read_value(bucket, &object.key).await?)
    };
    Ok(Entry {
        size: with_size.then(|| to_usize(object.size)),
        key: object.key,
        value,
    })
}

fn receiver_stream(rx: mpsc::Receiver<QueryResult>) -> ResultStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Send every result to `tx`, stopping after an error or when the receiver
/// is gone
async fn forward(mut results: ResultStream, tx: mpsc::Sender<QueryResult>) {
    while let Some(result) = results.next().await {
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            return;
        }
    }
}

/// Prefix listing with client-side offset and limit
async fn produce_strict(
    bucket: Arc<dyn Bucket>,
    options: ListOptions,
    query: Query,
    tx: mpsc::Sender<QueryResult>,
) {
    let mut listing = bucket.list(options);

    let mut skipped = 0;
    while skipped < query.offset {
        match listing.next().await {
            Ok(Some(object)) if object.is_dir => {}
            Ok(Some(_)) => skipped += 1,
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }

    let mut sent = 0;
    while query.limit == 0 || sent < query.limit {
        let object = match listing.next().await {
            Ok(Some(object)) if object.is_dir => continue,
            Ok(Some(object)) => object,
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        let result = load_entry(bucket.as_ref(), object, query.keys_only, query.returns_sizes).await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            return;
        }
        sent += 1;
    }
}
