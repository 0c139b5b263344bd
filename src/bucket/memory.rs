//! In-memory bucket

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::bucket::{
    fold_listing, Bucket, ListIterator, ListOptions, ObjectAttributes, ObjectReader, ObjectWriter,
};
use crate::error::{BucketError, BucketResult};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mod_time: DateTime<Utc>,
    etag: String,
}

type Objects = Arc<RwLock<BTreeMap<String, StoredObject>>>;

/// In-memory bucket, backing `mem://` URLs.
///
/// Clones share the same objects and the same open/closed state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucket {
    objects: Objects,
    closed: Arc<AtomicBool>,
}

impl MemoryBucket {
    /// Create a new, empty memory bucket
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    /// Whether the bucket holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> BucketResult<()> {
        check_open(&self.closed)
    }

    fn read(&self) -> BucketResult<RwLockReadGuard<'_, BTreeMap<String, StoredObject>>> {
        self.check_open()?;
        self.objects
            .read()
            .map_err(|e| BucketError::operation("lock_objects", e))
    }

    fn write(&self) -> BucketResult<RwLockWriteGuard<'_, BTreeMap<String, StoredObject>>> {
        self.check_open()?;
        self.objects
            .write()
            .map_err(|e| BucketError::operation("lock_objects", e))
    }
}

fn check_open(closed: &AtomicBool) -> BucketResult<()> {
    if closed.load(Ordering::Acquire) {
        return Err(BucketError::Closed);
    }
    Ok(())
}

fn not_found(name: &str) -> BucketError {
    BucketError::NotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    async fn exists(&self, name: &str) -> BucketResult<bool> {
        Ok(self.read()?.contains_key(name))
    }

    async fn attributes(&self, name: &str) -> BucketResult<ObjectAttributes> {
        let objects = self.read()?;
        let object = objects.get(name).ok_or_else(|| not_found(name))?;
        Ok(ObjectAttributes {
            size: object.data.len() as u64,
            mod_time: Some(object.mod_time),
            etag: Some(object.etag.clone()),
            content_type: None,
        })
    }

    async fn new_reader(&self, name: &str) -> BucketResult<ObjectReader> {
        let data = self
            .read()?
            .get(name)
            .map(|object| object.data.clone())
            .ok_or_else(|| not_found(name))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn new_writer(&self, name: &str) -> BucketResult<Box<dyn ObjectWriter>> {
        self.check_open()?;
        Ok(Box::new(MemoryWriter {
            objects: Arc::clone(&self.objects),
            closed: Arc::clone(&self.closed),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, name: &str) -> BucketResult<()> {
        self.write()?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    fn list(&self, options: ListOptions) -> ListIterator {
        let objects = match self.read() {
            Ok(objects) => objects,
            Err(e) => return ListIterator::failed(e),
        };

        let matching = objects
            .range(options.prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&options.prefix))
            .map(|(name, object)| (name.clone(), object.data.len() as u64));

        ListIterator::from_objects(fold_listing(
            matching,
            &options.prefix,
            options.delimiter.as_deref(),
        ))
    }

    async fn close(&self) -> BucketResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn scheme(&self) -> &'static str {
        "mem"
    }
}

struct MemoryWriter {
    objects: Objects,
    closed: Arc<AtomicBool>,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> BucketResult<()> {
        check_open(&self.closed)?;
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> BucketResult<()> {
        let MemoryWriter {
            objects,
            closed,
            name,
            buffer,
        } = *self;
        check_open(&closed)?;

        let object = StoredObject {
            data: Bytes::from(buffer),
            mod_time: Utc::now(),
            etag: uuid::Uuid::new_v4().simple().to_string(),
        };
        objects
            .write()
            .map_err(|e| BucketError::operation("lock_objects", e))?
            .insert(name, object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn put(bucket: &MemoryBucket, name: &str, data: &[u8]) {
        let mut writer = bucket.new_writer(name).await.unwrap();
        writer.write(data).await.unwrap();
        writer.close().await.unwrap();
    }

    async fn collect(mut iter: ListIterator) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(object) = iter.next().await.unwrap() {
            names.push(object.key);
        }
        names
    }

    #[tokio::test]
    async fn test_write_is_invisible_until_close() {
        let bucket = MemoryBucket::new();
        let mut writer = bucket.new_writer("/k").await.unwrap();
        writer.write(b"abc").await.unwrap();
        assert!(!bucket.exists("/k").await.unwrap());

        writer.close().await.unwrap();
        assert!(bucket.exists("/k").await.unwrap());
        assert_eq!(bucket.attributes("/k").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_read_and_delete() {
        let bucket = MemoryBucket::new();
        put(&bucket, "/k", b"value").await;

        let mut data = Vec::new();
        bucket
            .new_reader("/k")
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"value");

        bucket.delete("/k").await.unwrap();
        assert!(bucket.delete("/k").await.unwrap_err().is_not_found());
        assert!(bucket.new_reader("/k").await.is_err());
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let bucket = MemoryBucket::new();
        for name in ["/a/1", "/a/2", "/b/1", "/ab"] {
            put(&bucket, name, b"x").await;
        }

        let names = collect(bucket.list(ListOptions::with_prefix("/a/"))).await;
        assert_eq!(names, vec!["/a/1", "/a/2"]);

        let all = collect(bucket.list(ListOptions::default())).await;
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_closed_bucket_rejects_operations() {
        let bucket = MemoryBucket::new();
        put(&bucket, "/k", b"x").await;
        let writer = bucket.new_writer("/late").await.unwrap();

        bucket.close().await.unwrap();
        assert!(matches!(bucket.exists("/k").await, Err(BucketError::Closed)));
        assert!(matches!(writer.close().await, Err(BucketError::Closed)));
        assert!(collect_err(bucket.list(ListOptions::default())).await);
    }

    async fn collect_err(mut iter: ListIterator) -> bool {
        matches!(iter.next().await, Err(BucketError::Closed))
    }
}
