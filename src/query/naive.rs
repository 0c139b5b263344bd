//! Local application of query clauses to a stream of results
//!
//! Used by the naive query mode, and usable by any store that can only list.
//! Every combinator passes errors through untouched; [`apply`] additionally
//! ends the stream after the first error.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::DatastoreResult;
use crate::key;
use crate::query::{compare_entries, Entry, Filter, Order, Query, QueryResult};

/// Boxed stream of query results
pub type ResultStream = BoxStream<'static, QueryResult>;

/// Keep entries under `prefix` in the key hierarchy.
///
/// `/a` keeps `/a/1` but not `/ab`; an empty prefix or `/` keeps everything.
pub fn prefix(results: ResultStream, prefix: &str) -> ResultStream {
    let cleaned = key::clean(prefix);
    if cleaned == "/" {
        return results;
    }
    let dir = format!("{cleaned}/");
    results
        .filter(move |result| {
            let keep = match result {
                Ok(entry) => entry.key.starts_with(&dir),
                Err(_) => true,
            };
            futures::future::ready(keep)
        })
        .boxed()
}

/// Keep entries matching `filter`
pub fn filter(results: ResultStream, filter: Filter) -> ResultStream {
    results
        .filter(move |result| {
            let keep = match result {
                Ok(entry) => filter.matches(entry),
                Err(_) => true,
            };
            futures::future::ready(keep)
        })
        .boxed()
}

/// Sort entries by `orders`.
///
/// The whole stream is read before anything is emitted. If reading fails,
/// only that error is emitted.
pub fn order(results: ResultStream, orders: Vec<Order>) -> ResultStream {
    if orders.is_empty() {
        return results;
    }
    stream::once(async move {
        let collected: DatastoreResult<Vec<Entry>> = results.try_collect().await;
        match collected {
            Ok(mut entries) => {
                entries.sort_by(|a, b| compare_entries(&orders, a, b));
                stream::iter(entries.into_iter().map(Ok)).boxed()
            }
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        }
    })
    .flatten()
    .boxed()
}

/// Skip the first `count` entries; errors are never skipped
pub fn offset(results: ResultStream, count: usize) -> ResultStream {
    if count == 0 {
        return results;
    }
    let mut skipped = 0;
    results
        .filter(move |result| {
            let keep = match result {
                Ok(_) if skipped < count => {
                    skipped += 1;
                    false
                }
                _ => true,
            };
            futures::future::ready(keep)
        })
        .boxed()
}

/// Emit at most `count` results, 0 for no limit
pub fn limit(results: ResultStream, count: usize) -> ResultStream {
    if count == 0 {
        return results;
    }
    results.take(count).boxed()
}

/// End the stream right after its first error
pub fn stop_after_error(results: ResultStream) -> ResultStream {
    results
        .scan(false, |failed, result| {
            let item = if *failed {
                None
            } else {
                *failed = result.is_err();
                Some(result)
            };
            futures::future::ready(item)
        })
        .boxed()
}

/// Apply every clause of `query`: prefix, filters, orders, offset, limit
pub fn apply(query: &Query, results: ResultStream) -> ResultStream {
    let mut results = prefix(results, &query.prefix);
    for f in &query.filters {
        results = filter(results, f.clone());
    }
    results = order(results, query.orders.clone());
    results = offset(results, query.offset);
    results = limit(results, query.limit);
    stop_after_error(results)
}
