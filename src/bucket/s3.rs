//! AWS S3 bucket implementation
//!
//! This module provides an S3 bucket with support for:
//! - Existence checks and attributes via `HeadObject`
//! - Streaming reads of object bodies
//! - Buffered writes committed on close, with multipart uploads for large objects
//! - Paginated listing with continuation tokens and delimiter folding

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{
    error::SdkError,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption},
    Client as S3Client,
};
use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use tracing::{debug, trace};

use crate::bucket::{
    Bucket, BucketOpener, BucketUrl, ListIterator, ListObject, ListOptions, ObjectAttributes,
    ObjectReader, ObjectWriter,
};
use crate::config::constants::DEFAULT_LIST_PAGE_SIZE;
use crate::error::{BucketError, BucketResult};

/// S3 bucket configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// AWS access key ID (optional, can use IAM roles)
    pub access_key_id: Option<String>,
    /// AWS secret access key (optional, can use IAM roles)
    pub secret_access_key: Option<String>,
    /// S3 endpoint URL (for S3-compatible services)
    pub endpoint_url: Option<String>,
    /// Enable server-side encryption
    pub server_side_encryption: bool,
    /// Multipart upload threshold (bytes)
    pub multipart_threshold: u64,
    /// Multipart chunk size (bytes)
    pub multipart_chunk_size: u64,
    /// Enable path-style addressing
    pub path_style: bool,
    /// Keys requested per `ListObjectsV2` page
    pub page_size: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            endpoint_url: None,
            server_side_encryption: false,
            multipart_threshold: 100 * 1024 * 1024, // 100MB
            multipart_chunk_size: 10 * 1024 * 1024,  // 10MB
            path_style: false,
            page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

/// S3 bucket, backing `s3://` URLs
#[derive(Debug, Clone)]
pub struct S3Bucket {
    client: S3Client,
    config: Arc<S3Config>,
    closed: Arc<AtomicBool>,
}

impl S3Bucket {
    /// Create a new S3 bucket, loading AWS configuration from the environment
    /// and applying any overrides in `s3_config`
    pub async fn new(s3_config: S3Config) -> BucketResult<Self> {
        let aws_config = Self::build_aws_config(&s3_config).await;
        Ok(Self::from_sdk_config(&aws_config, s3_config))
    }

    /// Create an S3 bucket from an already loaded AWS configuration.
    ///
    /// Credentials and region come from `aws_config`; `s3_config` supplies the
    /// bucket name and upload/list tuning.
    pub fn from_sdk_config(aws_config: &aws_config::SdkConfig, s3_config: S3Config) -> Self {
        let client_config = aws_sdk_s3::config::Builder::from(aws_config)
            .force_path_style(s3_config.path_style)
            .build();
        Self::from_client(S3Client::from_conf(client_config), s3_config)
    }

    /// Wrap an existing S3 client
    pub fn from_client(client: S3Client, s3_config: S3Config) -> Self {
        debug!(bucket = %s3_config.bucket, "opened s3 bucket");
        Self {
            client,
            config: Arc::new(s3_config),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bucket configuration
    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Build AWS configuration
    async fn build_aws_config(config: &S3Config) -> aws_config::SdkConfig {
        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Set credentials if provided
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "blob-datastore",
            ));
        }

        // Set custom endpoint if provided
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }

        builder.load().await
    }

    /// Verify the bucket is reachable with the configured credentials
    pub async fn check_access(&self) -> BucketResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                BucketError::operation(
                    "head_bucket",
                    format!("Cannot access S3 bucket '{}': {}", self.config.bucket, e),
                )
            })
    }

    fn check_open(&self) -> BucketResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BucketError::Closed);
        }
        Ok(())
    }
}

fn not_found(name: &str) -> BucketError {
    BucketError::NotFound {
        name: name.to_string(),
    }
}

/// One `ListObjectsV2` page
async fn list_page(
    client: &S3Client,
    config: &S3Config,
    options: &ListOptions,
    continuation_token: Option<String>,
) -> BucketResult<(Vec<ListObject>, Option<String>)> {
    let page_size = options.page_size.unwrap_or(config.page_size).max(1);
    let response = client
        .list_objects_v2()
        .bucket(&config.bucket)
        .prefix(&options.prefix)
        .set_delimiter(options.delimiter.clone())
        .max_keys(i32::try_from(page_size).unwrap_or(i32::MAX))
        .set_continuation_token(continuation_token)
        .send()
        .await
        .map_err(|e| BucketError::operation("list_objects", e))?;

    let mut objects: Vec<ListObject> = response
        .contents
        .unwrap_or_default()
        .into_iter()
        .filter_map(|object| {
            let size = object.size.unwrap_or(0).max(0) as u64;
            object.key.map(|key| ListObject::object(key, size))
        })
        .collect();
    objects.extend(
        response
            .common_prefixes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|prefix| prefix.prefix.map(ListObject::dir)),
    );
    objects.sort_unstable_by(|a, b| a.key.cmp(&b.key));

    let next = if response.is_truncated.unwrap_or(false) {
        response.next_continuation_token
    } else {
        None
    };
    Ok((objects, next))
}

/// Upload `data` in parts
async fn multipart_upload(
    client: &S3Client,
    config: &S3Config,
    key: &str,
    data: Bytes,
) -> BucketResult<()> {
    // Initiate multipart upload
    let create_output = client
        .create_multipart_upload()
        .bucket(&config.bucket)
        .key(key)
        .set_server_side_encryption(
            config
                .server_side_encryption
                .then_some(ServerSideEncryption::Aes256),
        )
        .send()
        .await
        .map_err(|e| BucketError::operation("create_multipart_upload", e))?;

    let upload_id = create_output
        .upload_id
        .ok_or_else(|| BucketError::operation("create_multipart_upload", "No upload ID returned"))?;

    // Upload parts
    let mut completed_parts = Vec::new();
    let chunk_size = config.multipart_chunk_size.max(1) as usize;

    for (index, chunk) in data.chunks(chunk_size).enumerate() {
        let part_number = (index + 1) as i32;

        let upload_part_output = match client
            .upload_part()
            .bucket(&config.bucket)
            .key(key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data.slice_ref(chunk)))
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let _ = client
                    .abort_multipart_upload()
                    .bucket(&config.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                return Err(BucketError::operation(
                    "upload_part",
                    format!("Failed to upload part {}: {}", part_number, e),
                ));
            }
        };

        completed_parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(upload_part_output.e_tag)
                .build(),
        );
    }

    // Complete multipart upload
    let completed_upload = CompletedMultipartUpload::builder()
        .set_parts(Some(completed_parts))
        .build();

    client
        .complete_multipart_upload()
        .bucket(&config.bucket)
        .key(key)
        .upload_id(&upload_id)
        .multipart_upload(completed_upload)
        .send()
        .await
        .map_err(|e| BucketError::operation("complete_multipart_upload", e))?;

    Ok(())
}

#[async_trait]
impl Bucket for S3Bucket {
    async fn exists(&self, name: &str) -> BucketResult<bool> {
        match self.attributes(name).await {
            Ok(_) => Ok(true),
            Err(BucketError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn attributes(&self, name: &str) -> BucketResult<ObjectAttributes> {
        self.check_open()?;
        let head = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| match e {
                SdkError::ServiceError(ref service_err) if service_err.err().is_not_found() => {
                    not_found(name)
                }
                _ => BucketError::operation("head_object", e),
            })?;

        Ok(ObjectAttributes {
            size: head.content_length.unwrap_or(0).max(0) as u64,
            mod_time: head.last_modified.and_then(|dt| {
                chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
            }),
            etag: head.e_tag,
            content_type: head.content_type,
        })
    }

    async fn new_reader(&self, name: &str) -> BucketResult<ObjectReader> {
        self.check_open()?;
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| match e {
                SdkError::ServiceError(ref service_err) if service_err.err().is_no_such_key() => {
                    not_found(name)
                }
                _ => BucketError::operation("get_object", e),
            })?;

        Ok(Box::pin(response.body.into_async_read()))
    }

    async fn new_writer(&self, name: &str) -> BucketResult<Box<dyn ObjectWriter>> {
        self.check_open()?;
        Ok(Box::new(S3Writer {
            bucket: self.clone(),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, name: &str) -> BucketResult<()> {
        // DeleteObject succeeds for missing keys; report them like the other backends
        self.attributes(name).await?;

        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| BucketError::operation("delete_object", e))?;
        Ok(())
    }

    fn list(&self, options: ListOptions) -> ListIterator {
        if let Err(e) = self.check_open() {
            return ListIterator::failed(e);
        }

        let client = self.client.clone();
        let config = Arc::clone(&self.config);

        // state: None once the final page has been fetched
        let pages = stream::try_unfold(Some(None::<String>), move |state| {
            let client = client.clone();
            let config = Arc::clone(&config);
            let options = options.clone();
            async move {
                let Some(token) = state else {
                    return Ok(None);
                };
                let (objects, next) = list_page(&client, &config, &options, token).await?;
                trace!(count = objects.len(), more = next.is_some(), "listed s3 page");
                let next_state = next.map(Some);
                Ok(Some((objects, next_state)))
            }
        });

        ListIterator::new(
            pages
                .map_ok(|objects| stream::iter(objects.into_iter().map(Ok)))
                .try_flatten(),
        )
    }

    async fn close(&self) -> BucketResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn scheme(&self) -> &'static str {
        "s3"
    }
}

struct S3Writer {
    bucket: S3Bucket,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write(&mut self, buf: &[u8]) -> BucketResult<()> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> BucketResult<()> {
        let S3Writer {
            bucket,
            name,
            buffer,
        } = *self;
        bucket.check_open()?;
        let config = &bucket.config;
        let data = Bytes::from(buffer);

        // Use multipart upload for large objects
        if data.len() as u64 > config.multipart_threshold {
            return multipart_upload(&bucket.client, config, &name, data).await;
        }

        let mut request = bucket
            .client
            .put_object()
            .bucket(&config.bucket)
            .key(&name)
            .body(ByteStream::from(data));

        if config.server_side_encryption {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request
            .send()
            .await
            .map_err(|e| BucketError::operation("put_object", e))?;
        Ok(())
    }
}

/// Opener for `s3://bucket?region=..&endpoint=..&use_path_style=true`
#[derive(Debug, Default, Clone, Copy)]
pub struct S3Opener;

#[async_trait]
impl BucketOpener for S3Opener {
    async fn open(&self, url: &BucketUrl) -> BucketResult<Arc<dyn Bucket>> {
        if url.bucket().is_empty() {
            return Err(BucketError::InvalidUrl {
                url: url.to_string(),
                reason: "missing bucket name".to_string(),
            });
        }

        let defaults = S3Config::default();
        let config = S3Config {
            bucket: url.bucket().to_string(),
            region: url.param("region").map_or(defaults.region.clone(), str::to_string),
            endpoint_url: url.param("endpoint").map(str::to_string),
            path_style: url.flag("use_path_style", false)?,
            server_side_encryption: url.flag("sse", false)?,
            ..defaults
        };
        Ok(Arc::new(S3Bucket::new(config).await?))
    }
}
