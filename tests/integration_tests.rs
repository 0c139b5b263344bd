//! Integration tests for the blob datastore

mod common;

use std::sync::Arc;

use blob_datastore::bucket::{Bucket, BucketUrl, MemoryBucket};
use blob_datastore::prelude::*;
use blob_datastore::query::CompareOp;
use bytes::Bytes;
use common::{datastore, KINDS};
use futures::StreamExt;
use tempfile::TempDir;

async fn fill(store: &BlobDatastore, keys: &[&str]) {
    for k in keys {
        store
            .put(&Key::new(k), format!("value of {k}").as_bytes())
            .await
            .unwrap();
    }
}

async fn query_keys(store: &BlobDatastore, query: Query) -> Vec<String> {
    let mut keys: Vec<String> = store
        .query(query)
        .await
        .unwrap()
        .rest()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect();
    keys.sort();
    keys
}

#[test]
fn test_library_version() {
    assert!(!blob_datastore::VERSION.is_empty());
    assert_eq!(blob_datastore::CRATE_NAME, "blob-datastore");
}

#[tokio::test]
async fn test_missing_keys() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        let key = Key::new("/never/written");

        assert!(!store.has(&key).await.unwrap(), "{kind}");
        assert!(store.get(&key).await.unwrap_err().is_not_found(), "{kind}");
        assert!(store.get_size(&key).await.unwrap_err().is_not_found(), "{kind}");
        store.delete(&key).await.unwrap();
    }
}

#[tokio::test]
async fn test_put_get_overwrite_delete() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        let key = Key::new("/blocks/abc");

        store.put(&key, b"first").await.unwrap();
        assert!(store.has(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(store.get_size(&key).await.unwrap(), 5);

        store.put(&key, b"a longer second value").await.unwrap();
        let value = store.get(&key).await.unwrap();
        assert_eq!(value.as_ref(), b"a longer second value");
        assert_eq!(store.get_size(&key).await.unwrap(), value.len());

        store.delete(&key).await.unwrap();
        assert!(!store.has(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn test_empty_value() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        let key = Key::new("/empty");
        store.put(&key, b"").await.unwrap();
        assert!(store.has(&key).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_empty());
        assert_eq!(store.get_size(&key).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_prefix_query() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        fill(&store, &["/a/1", "/a/2", "/b/1"]).await;

        let keys = query_keys(&store, Query::with_prefix("/a/")).await;
        assert_eq!(keys, vec!["/a/1", "/a/2"], "{kind}");
    }
}

#[tokio::test]
async fn test_offset_and_limit() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        fill(&store, &["/q/1", "/q/2", "/q/3"]).await;

        let all: Vec<String> = store
            .query(Query::with_prefix("/q/"))
            .await
            .unwrap()
            .rest()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(all.len(), 3);

        let query = Query {
            prefix: "/q/".into(),
            offset: 1,
            limit: 1,
            ..Default::default()
        };
        let page = store.query(query).await.unwrap().rest().await.unwrap();
        assert_eq!(page.len(), 1, "{kind}");
        assert_eq!(page[0].key, all[1], "{kind}");

        let past_end = Query {
            prefix: "/q/".into(),
            offset: 5,
            ..Default::default()
        };
        assert!(store.query(past_end).await.unwrap().rest().await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_keys_only_and_sizes() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        fill(&store, &["/s/1", "/s/22"]).await;

        let query = Query {
            keys_only: true,
            returns_sizes: true,
            ..Default::default()
        };
        let entries = store.query(query).await.unwrap().rest().await.unwrap();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            assert!(entry.value.is_none());
            assert_eq!(entry.size, Some(format!("value of {}", entry.key).len()));
        }

        let with_values = store.query(Query::default()).await.unwrap().rest().await.unwrap();
        for entry in with_values {
            let expected = format!("value of {}", entry.key);
            assert_eq!(entry.value.as_deref(), Some(expected.as_bytes()));
            assert!(entry.size.is_none());
        }
    }
}

#[tokio::test]
async fn test_strict_rejects_before_listing() {
    common::init_tracing();
    let bucket = MemoryBucket::new();
    let store = BlobDatastore::with_bucket(
        Arc::new(bucket.clone()),
        "closed",
        DatastoreConfig::default(),
    );
    // a closed bucket fails every call, so only a rejection made up front can surface
    bucket.close().await.unwrap();

    let query = Query {
        orders: vec![Order::ByValue],
        ..Default::default()
    };
    assert!(matches!(
        store.query(query).await,
        Err(DatastoreError::UnsupportedQuery { .. })
    ));
}

#[tokio::test]
async fn test_naive_mode_orders_and_filters() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Naive);
        fill(&store, &["/n/a", "/n/b", "/n/c", "/nn/a"]).await;

        let query = Query {
            prefix: "/n".into(),
            filters: vec![Filter::ValueCompare {
                op: CompareOp::GreaterThan,
                value: Bytes::from_static(b"value of /n/a"),
            }],
            orders: vec![Order::ByValueDescending],
            offset: 0,
            limit: 5,
            ..Default::default()
        };
        let entries = store.query(query).await.unwrap().rest().await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/n/c", "/n/b"], "{kind}");
        assert!(entries.iter().all(|e| e.size.is_some()));
    }
}

#[tokio::test]
async fn test_closing_results_early() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        let keys: Vec<String> = (0..20).map(|i| format!("/many/{i:02}")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        fill(&store, &refs).await;

        let mut results = store.query(Query::default()).await.unwrap();
        assert!(results.next().await.unwrap().is_ok());
        results.close().await;

        let results = store.query(Query::default()).await.unwrap();
        drop(results);

        // the store is still usable afterwards
        assert_eq!(query_keys(&store, Query::default()).await.len(), 20);
    }
}

#[tokio::test]
async fn test_closed_datastore() {
    for kind in KINDS {
        let (store, _dir) = datastore(kind, QueryMode::Strict);
        store.put(&Key::new("/k"), b"v").await.unwrap();
        store.close().await.unwrap();

        let err = store.get(&Key::new("/k")).await.unwrap_err();
        assert!(matches!(err, DatastoreError::Bucket(BucketError::Closed)), "{kind}");

        let mut results = store.query(Query::default()).await.unwrap();
        assert!(results.next().await.unwrap().is_err());
    }
}

#[tokio::test]
async fn test_file_bucket_round_trips_odd_keys() {
    let (store, _dir) = datastore("file", QueryMode::Strict);
    let keys = [
        "/a",
        "/a/b",
        "/with space/and%percent",
        "/dots/.../x",
        "/unicode/ключ",
        "/tmp-looking/%tmp-file",
    ];
    for (i, k) in keys.iter().enumerate() {
        store.put(&Key::new(k), &[i as u8; 3]).await.unwrap();
    }
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(store.get(&Key::new(k)).await.unwrap().as_ref(), &[i as u8; 3]);
    }

    let mut expected: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    expected.sort();
    assert_eq!(query_keys(&store, Query::default()).await, expected);
    assert_eq!(store.disk_usage().await.unwrap(), 3 * keys.len() as u64);
}

#[tokio::test]
async fn test_file_datastore_persists_across_opens() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let url = format!("file://{}", temp_dir.path().display());

    let store = BlobDatastore::open(&url, DatastoreConfig::default()).await.unwrap();
    store.put(&Key::new("/persist/me"), b"still here").await.unwrap();
    store.close().await.unwrap();

    let reopened = BlobDatastore::open(&url, DatastoreConfig::default()).await.unwrap();
    assert_eq!(
        reopened.get(&Key::new("/persist/me")).await.unwrap().as_ref(),
        b"still here"
    );
}

#[tokio::test]
async fn test_registry_schemes() {
    common::init_tracing();
    let err = BlobDatastore::open("nope://bucket", DatastoreConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Bucket(BucketError::UnsupportedScheme { .. })
    ));

    let err = BlobDatastore::open("not a url", DatastoreConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bucket(BucketError::InvalidUrl { .. })));

    let shared = MemoryBucket::new();
    let mut registry = BucketRegistry::default();
    let handle = shared.clone();
    registry.register("azblob", move |url: BucketUrl| {
        let bucket = handle.clone();
        async move {
            assert_eq!(url.bucket(), "container");
            Ok::<_, BucketError>(Arc::new(bucket) as Arc<dyn Bucket>)
        }
    });

    let store = BlobDatastore::open_with_registry(
        &registry,
        "azblob://container",
        DatastoreConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(store.bucket_name(), "container");
    store.put(&Key::new("/x"), b"y").await.unwrap();
    assert!(shared.exists("/x").await.unwrap());
}
