//! Datastore benchmarks

use std::sync::Arc;

use blob_datastore::bucket::MemoryBucket;
use blob_datastore::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

fn populated_store(runtime: &Runtime, mode: QueryMode, count: usize) -> BlobDatastore {
    let store = BlobDatastore::with_bucket(
        Arc::new(MemoryBucket::new()),
        "bench",
        DatastoreConfig::with_query_mode(mode),
    );
    runtime.block_on(async {
        for i in 0..count {
            let key = Key::new(format!("/bench/{}/{i:06}", i % 10));
            store.put(&key, &[0u8; 256]).await.unwrap();
        }
    });
    store
}

fn benchmark_key_cleaning(c: &mut Criterion) {
    c.bench_function("key_clean_messy_path", |b| {
        b.iter(|| {
            let _key = black_box(Key::new(black_box("//a/./b/../c//d/")));
        })
    });
}

fn benchmark_put_get(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let store = populated_store(&runtime, QueryMode::Strict, 0);
    let key = Key::new("/bench/value");
    let value = vec![7u8; 4096];
    let (store, key, value) = (&store, &key, value.as_slice());

    c.bench_function("memory_put_get_4kb", |b| {
        b.to_async(&runtime).iter(|| async move {
            store.put(key, value).await.unwrap();
            black_box(store.get(key).await.unwrap());
        })
    });
}

fn benchmark_queries(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let strict = populated_store(&runtime, QueryMode::Strict, 1000);
    let naive = populated_store(&runtime, QueryMode::Naive, 1000);
    let (strict, naive) = (&strict, &naive);

    c.bench_function("strict_prefix_keys_only", |b| {
        b.to_async(&runtime).iter(|| async move {
            let query = Query {
                prefix: "/bench/3/".into(),
                keys_only: true,
                ..Default::default()
            };
            black_box(strict.query(query).await.unwrap().rest().await.unwrap());
        })
    });

    c.bench_function("naive_ordered_limit", |b| {
        b.to_async(&runtime).iter(|| async move {
            let query = Query {
                prefix: "/bench".into(),
                orders: vec![Order::ByKeyDescending],
                limit: 10,
                keys_only: true,
                ..Default::default()
            };
            black_box(naive.query(query).await.unwrap().rest().await.unwrap());
        })
    });
}

criterion_group!(benches, benchmark_key_cleaning, benchmark_put_get, benchmark_queries);
criterion_main!(benches);
