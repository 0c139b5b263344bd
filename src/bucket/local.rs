//! Local filesystem bucket implementation
//!
//! Objects are stored as files under a base directory:
//! - Object names are split on `/`; each segment is percent-encoded, so any
//!   name (leading `/`, empty or `.`/`..` segments) maps to a safe path
//! - Directory segments carry a trailing `%`, which encoding never produces,
//!   so the object `/a` and the objects below `/a/` never collide on disk
//! - Writes go to a temporary file that is renamed into place on close
//! - Listing walks the tree and skips in-flight temporary files
//! - Directories are never removed, so a delete cannot pull a directory out
//!   from under a concurrent write

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::fs as async_fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, trace};

use crate::bucket::{
    fold_listing, Bucket, ListIterator, ListOptions, ObjectAttributes, ObjectReader, ObjectWriter,
};
use crate::error::{BucketError, BucketResult};

/// Marks an encoded segment as a directory
const DIR_MARKER: char = '%';

/// Prefix of in-flight temporary files
const TEMP_PREFIX: &str = "%tmp-";

/// Local bucket configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Base directory for objects
    pub base_path: PathBuf,
    /// Create the base directory if it doesn't exist
    pub create_dirs: bool,
    /// File permissions (Unix only)
    pub file_permissions: Option<u32>,
    /// Directory permissions (Unix only)
    pub dir_permissions: Option<u32>,
    /// Sync file contents to disk before the rename that commits a write
    pub sync_on_close: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./storage"),
            create_dirs: true,
            file_permissions: Some(0o644),
            dir_permissions: Some(0o755),
            sync_on_close: true,
        }
    }
}

/// Local filesystem bucket, backing `file://` URLs
#[derive(Debug, Clone)]
pub struct FileBucket {
    config: Arc<LocalConfig>,
    closed: Arc<AtomicBool>,
}

impl FileBucket {
    /// Create a new filesystem bucket rooted at `config.base_path`
    pub fn new(config: LocalConfig) -> BucketResult<Self> {
        if config.create_dirs && !config.base_path.exists() {
            fs::create_dir_all(&config.base_path)
                .map_err(|e| BucketError::operation("create_base_directory", e))?;
            set_permissions(&config.base_path, config.dir_permissions)?;
        }

        if !config.base_path.is_dir() {
            return Err(BucketError::operation(
                "verify_base_directory",
                format!(
                    "{} does not exist or is not a directory",
                    config.base_path.display()
                ),
            ));
        }

        debug!(base_path = %config.base_path.display(), "opened file bucket");
        Ok(Self {
            config: Arc::new(config),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open a bucket at `path` with default settings
    pub fn open(path: impl Into<PathBuf>) -> BucketResult<Self> {
        Self::new(LocalConfig {
            base_path: path.into(),
            ..Default::default()
        })
    }

    /// Base directory of this bucket
    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    fn check_open(&self) -> BucketResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BucketError::Closed);
        }
        Ok(())
    }

    /// Filesystem path for an object name
    fn object_path(&self, name: &str) -> PathBuf {
        let mut path = self.config.base_path.clone();
        let mut segments = name.split('/').peekable();
        while let Some(segment) = segments.next() {
            let mut encoded = encode_segment(segment);
            if segments.peek().is_some() {
                encoded.push(DIR_MARKER);
            }
            path.push(encoded);
        }
        path
    }

    /// Create missing parent directories of `path`
    async fn ensure_parent_dir(&self, path: &Path) -> BucketResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if async_fs::try_exists(parent).await? {
            return Ok(());
        }

        async_fs::create_dir_all(parent)
            .await
            .map_err(|e| BucketError::operation("create_parent_directory", e))?;

        let mut dir = parent;
        while dir != self.config.base_path.as_path() {
            set_permissions(dir, self.config.dir_permissions)?;
            match dir.parent() {
                Some(up) => dir = up,
                None => break,
            }
        }
        Ok(())
    }
}

fn set_permissions(path: &Path, mode: Option<u32>) -> BucketResult<()> {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| BucketError::operation("set_permissions", e))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

fn encode_segment(segment: &str) -> String {
    match segment {
        "" => "%2F".to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        other => urlencoding::encode(other).into_owned(),
    }
}

fn decode_segment(encoded: &str) -> Option<String> {
    let decoded = urlencoding::decode(encoded).ok()?;
    // "%2F" stands for an empty segment
    if decoded == "/" {
        Some(String::new())
    } else {
        Some(decoded.into_owned())
    }
}

fn map_not_found(name: &str, operation: &str, e: std::io::Error) -> BucketError {
    match e.kind() {
        std::io::ErrorKind::NotFound => BucketError::NotFound {
            name: name.to_string(),
        },
        _ => BucketError::operation(operation, e),
    }
}

/// Recursively collect `(name, size)` for every object whose name could
/// match `prefix`.
async fn walk(base: PathBuf, prefix: String) -> BucketResult<Vec<(String, u64)>> {
    let mut objects = Vec::new();
    if !async_fs::try_exists(&base).await? {
        return Ok(objects);
    }

    let mut pending = vec![(base, String::new())];
    while let Some((dir, dir_name)) = pending.pop() {
        let mut entries = async_fs::read_dir(&dir)
            .await
            .map_err(|e| BucketError::operation("read_directory", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BucketError::operation("read_directory_entry", e))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| BucketError::operation("read_file_type", e))?;

            if file_type.is_dir() {
                let Some(segment) = file_name
                    .strip_suffix(DIR_MARKER)
                    .and_then(decode_segment)
                else {
                    continue;
                };
                let child = format!("{dir_name}{segment}/");
                if child.starts_with(&prefix) || prefix.starts_with(&child) {
                    pending.push((entry.path(), child));
                }
            } else if file_type.is_file() && !file_name.starts_with(TEMP_PREFIX) {
                let Some(segment) = decode_segment(file_name) else {
                    continue;
                };
                let name = format!("{dir_name}{segment}");
                if name.starts_with(&prefix) {
                    let metadata = entry
                        .metadata()
                        .await
                        .map_err(|e| BucketError::operation("read_metadata", e))?;
                    objects.push((name, metadata.len()));
                }
            }
        }
    }

    objects.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    Ok(objects)
}

#[async_trait]
impl Bucket for FileBucket {
    async fn exists(&self, name: &str) -> BucketResult<bool> {
        self.check_open()?;
        match async_fs::metadata(self.object_path(name)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BucketError::operation("stat_file", e)),
        }
    }

    async fn attributes(&self, name: &str) -> BucketResult<ObjectAttributes> {
        self.check_open()?;
        let metadata = async_fs::metadata(self.object_path(name))
            .await
            .map_err(|e| map_not_found(name, "stat_file", e))?;
        if !metadata.is_file() {
            return Err(BucketError::NotFound {
                name: name.to_string(),
            });
        }

        Ok(ObjectAttributes {
            size: metadata.len(),
            mod_time: metadata.modified().ok().map(chrono::DateTime::from),
            etag: None,
            content_type: None,
        })
    }

    async fn new_reader(&self, name: &str) -> BucketResult<ObjectReader> {
        self.check_open()?;
        let file = async_fs::File::open(self.object_path(name))
            .await
            .map_err(|e| map_not_found(name, "open_file", e))?;
        Ok(Box::pin(file))
    }

    async fn new_writer(&self, name: &str) -> BucketResult<Box<dyn ObjectWriter>> {
        self.check_open()?;
        let path = self.object_path(name);
        self.ensure_parent_dir(&path).await?;

        let temp_path = path.with_file_name(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        let file = async_fs::File::create(&temp_path)
            .await
            .map_err(|e| BucketError::operation("create_temp_file", e))?;
        trace!(name, temp = %temp_path.display(), "opened file writer");

        Ok(Box::new(FileWriter {
            file: Some(BufWriter::new(file)),
            failed: false,
            temp_path,
            path,
            config: Arc::clone(&self.config),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn delete(&self, name: &str) -> BucketResult<()> {
        self.check_open()?;
        let path = self.object_path(name);
        let metadata = async_fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(name, "stat_file", e))?;
        if !metadata.is_file() {
            return Err(BucketError::NotFound {
                name: name.to_string(),
            });
        }

        async_fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(name, "delete_file", e))?;
        Ok(())
    }

    fn list(&self, options: ListOptions) -> ListIterator {
        if let Err(e) = self.check_open() {
            return ListIterator::failed(e);
        }

        let base = self.config.base_path.clone();
        let listing = stream::once(async move {
            let objects = walk(base, options.prefix.clone()).await?;
            Ok::<_, BucketError>(fold_listing(
                objects,
                &options.prefix,
                options.delimiter.as_deref(),
            ))
        })
        .flat_map(|result| match result {
            Ok(objects) => stream::iter(objects.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        });

        ListIterator::new(listing)
    }

    async fn close(&self) -> BucketResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn scheme(&self) -> &'static str {
        "file"
    }
}

struct FileWriter {
    file: Option<BufWriter<async_fs::File>>,
    /// Set once a write fails; the temporary file is then never committed
    failed: bool,
    temp_path: PathBuf,
    path: PathBuf,
    config: Arc<LocalConfig>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ObjectWriter for FileWriter {
    async fn write(&mut self, buf: &[u8]) -> BucketResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| BucketError::operation("write_file", "writer already closed"))?;
        if self.failed {
            return Err(BucketError::operation("write_file", "earlier write failed"));
        }
        if let Err(e) = file.write_all(buf).await {
            self.failed = true;
            return Err(BucketError::operation("write_temp_file", e));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> BucketResult<()> {
        let mut this = self;
        if this.closed.load(Ordering::Acquire) {
            return Err(BucketError::Closed);
        }
        let mut file = this
            .file
            .take()
            .ok_or_else(|| BucketError::operation("close_file", "writer already closed"))?;

        if this.failed {
            drop(file);
            let _ = async_fs::remove_file(&this.temp_path).await;
            return Err(BucketError::operation(
                "close_file",
                "discarding object after a failed write",
            ));
        }

        file.flush()
            .await
            .map_err(|e| BucketError::operation("flush_temp_file", e))?;
        if this.config.sync_on_close {
            file.get_ref()
                .sync_all()
                .await
                .map_err(|e| BucketError::operation("sync_temp_file", e))?;
        }
        drop(file);

        set_permissions(&this.temp_path, this.config.file_permissions)?;
        if let Err(e) = async_fs::rename(&this.temp_path, &this.path).await {
            let _ = async_fs::remove_file(&this.temp_path).await;
            return Err(BucketError::operation("atomic_rename", e));
        }
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        // still holding the file means the write was never committed
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
