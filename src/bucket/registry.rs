//! Bucket registry: URL scheme to opener
//!
//! The registry is an ordinary value built at start-up and handed to whatever
//! opens buckets. [`BucketRegistry::default`] knows the built-in schemes:
//!
//! | URL | Bucket |
//! |---|---|
//! | `mem://` or `mem://name` | fresh [`MemoryBucket`] |
//! | `file:///abs/path`, `file://rel/path`, `/abs/path`, `./rel/path` | [`FileBucket`] |
//! | `s3://bucket?region=..&endpoint=..&use_path_style=true` | `S3Bucket` (`s3` feature) |
//! | `gs://bucket?credentials=/path/key.json` | `GcsBucket` (`gcs` feature) |
//!
//! Other providers (for example `azblob`) are added with
//! [`BucketRegistry::register`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::bucket::{Bucket, FileBucket, LocalConfig, MemoryBucket};
use crate::error::{BucketError, BucketResult};

/// A parsed bucket URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketUrl {
    raw: String,
    scheme: String,
    location: String,
    params: BTreeMap<String, String>,
}

impl BucketUrl {
    /// Parse `scheme://location?key=value&...`.
    ///
    /// Bare paths starting with `/` or `./` are read as `file` URLs.
    pub fn parse(url: &str) -> BucketResult<Self> {
        let invalid = |reason: &str| BucketError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None if url.starts_with('/') || url.starts_with("./") => ("file", url),
            None => return Err(invalid("missing scheme")),
        };

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("malformed scheme"));
        }

        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut params = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).map_err(|_| invalid("bad query encoding"))?;
            let value = urlencoding::decode(value).map_err(|_| invalid("bad query encoding"))?;
            params.insert(key.into_owned(), value.into_owned());
        }

        Ok(Self {
            raw: url.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            location: location.to_string(),
            params,
        })
    }

    /// The URL as given
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Lower-cased scheme
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Everything between `://` and `?`
    pub fn location(&self) -> &str {
        &self.location
    }

    /// First `/`-separated part of the location (the bucket name for cloud URLs)
    pub fn bucket(&self) -> &str {
        self.location.split('/').next().unwrap_or("")
    }

    /// Query parameter value
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Boolean query parameter; absent means `default`
    pub fn flag(&self, key: &str, default: bool) -> BucketResult<bool> {
        match self.param(key) {
            None => Ok(default),
            Some("" | "1" | "true") => Ok(true),
            Some("0" | "false") => Ok(false),
            Some(other) => Err(BucketError::InvalidUrl {
                url: self.raw.clone(),
                reason: format!("{key} must be true or false, got {other}"),
            }),
        }
    }

    /// All query parameters
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

impl fmt::Display for BucketUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Opens buckets for one URL scheme
#[async_trait]
pub trait BucketOpener: Send + Sync {
    /// Open the bucket named by `url`
    async fn open(&self, url: &BucketUrl) -> BucketResult<Arc<dyn Bucket>>;
}

#[async_trait]
impl<F, Fut> BucketOpener for F
where
    F: Fn(BucketUrl) -> Fut + Send + Sync,
    Fut: Future<Output = BucketResult<Arc<dyn Bucket>>> + Send,
{
    async fn open(&self, url: &BucketUrl) -> BucketResult<Arc<dyn Bucket>> {
        (self)(url.clone()).await
    }
}

/// Opener for `mem://`; every open yields a new, empty bucket
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryOpener;

#[async_trait]
impl BucketOpener for MemoryOpener {
    async fn open(&self, _url: &BucketUrl) -> BucketResult<Arc<dyn Bucket>> {
        Ok(Arc::new(MemoryBucket::new()))
    }
}

/// Opener for `file://`.
///
/// Query parameters: `create_dir` (default true), `sync` (default true).
#[derive(Debug, Default, Clone, Copy)]
pub struct FileOpener;

#[async_trait]
impl BucketOpener for FileOpener {
    async fn open(&self, url: &BucketUrl) -> BucketResult<Arc<dyn Bucket>> {
        if url.location().is_empty() {
            return Err(BucketError::InvalidUrl {
                url: url.to_string(),
                reason: "missing directory path".to_string(),
            });
        }

        let config = LocalConfig {
            base_path: url.location().into(),
            create_dirs: url.flag("create_dir", true)?,
            sync_on_close: url.flag("sync", true)?,
            ..Default::default()
        };
        let bucket = tokio::task::spawn_blocking(move || FileBucket::new(config))
            .await
            .map_err(|e| BucketError::operation("open_file_bucket", e))??;
        Ok(Arc::new(bucket))
    }
}

/// Scheme to opener map
#[derive(Clone)]
pub struct BucketRegistry {
    openers: HashMap<String, Arc<dyn BucketOpener>>,
}

impl BucketRegistry {
    /// A registry with no schemes at all
    pub fn empty() -> Self {
        Self {
            openers: HashMap::new(),
        }
    }

    /// Register `opener` for `scheme`, returning the opener it replaces
    pub fn register(
        &mut self,
        scheme: &str,
        opener: impl BucketOpener + 'static,
    ) -> Option<Arc<dyn BucketOpener>> {
        self.openers
            .insert(scheme.to_ascii_lowercase(), Arc::new(opener))
    }

    /// Whether `scheme` has an opener
    pub fn contains(&self, scheme: &str) -> bool {
        self.openers.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.openers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Open the bucket named by `url`
    #[instrument(skip(self))]
    pub async fn open(&self, url: &str) -> BucketResult<Arc<dyn Bucket>> {
        let parsed = BucketUrl::parse(url)?;
        let opener = self
            .openers
            .get(parsed.scheme())
            .ok_or_else(|| BucketError::UnsupportedScheme {
                scheme: parsed.scheme().to_string(),
            })?;

        let bucket = opener.open(&parsed).await?;
        debug!(scheme = parsed.scheme(), "opened bucket");
        Ok(bucket)
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("mem", MemoryOpener);
        registry.register("file", FileOpener);
        #[cfg(feature = "s3")]
        registry.register("s3", crate::bucket::s3::S3Opener);
        #[cfg(feature = "gcs")]
        registry.register("gs", crate::bucket::gcs::GcsOpener);
        registry
    }
}

impl fmt::Debug for BucketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}
