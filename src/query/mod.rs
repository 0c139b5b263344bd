//! Query model and lazily consumed query results
//!
//! A [`Query`] describes which entries to return and in what shape. Queries
//! run on a background task and deliver [`QueryResult`]s through
//! [`Results`], a stream that is consumed incrementally. Dropping the stream
//! (or calling [`Results::close`]) stops the task and any backend request it
//! has in flight.

pub mod naive;

use std::cmp::Ordering;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::task::JoinHandle;

use crate::error::{DatastoreError, DatastoreResult};
use crate::key::compare_paths;

/// Comparison operator for filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
}

impl CompareOp {
    /// Whether `ordering` (of entry vs. operand) satisfies the operator
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Equal => ordering == Ordering::Equal,
            CompareOp::NotEqual => ordering != Ordering::Equal,
            CompareOp::GreaterThan => ordering == Ordering::Greater,
            CompareOp::GreaterThanOrEqual => ordering != Ordering::Less,
            CompareOp::LessThan => ordering == Ordering::Less,
            CompareOp::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
            CompareOp::GreaterThan => ">",
            CompareOp::GreaterThanOrEqual => ">=",
            CompareOp::LessThan => "<",
            CompareOp::LessThanOrEqual => "<=",
        })
    }
}

/// Predicate an entry must satisfy to be returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Compare the entry key against `key`
    KeyCompare {
        /// Comparison applied as `entry.key <op> key`
        op: CompareOp,
        /// Right-hand side
        key: String,
    },
    /// Compare the entry value bytes against `value`; a missing value
    /// compares as empty
    ValueCompare {
        /// Comparison applied as `entry.value <op> value`
        op: CompareOp,
        /// Right-hand side
        value: Bytes,
    },
    /// Entry key starts with the given string
    KeyPrefix(String),
}

impl Filter {
    /// Whether `entry` passes this filter
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::KeyCompare { op, key } => op.holds(entry.key.as_str().cmp(key.as_str())),
            Filter::ValueCompare { op, value } => {
                let actual: &[u8] = entry.value.as_deref().unwrap_or_default();
                op.holds(actual.cmp(value.as_ref()))
            }
            Filter::KeyPrefix(prefix) => entry.key.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::KeyCompare { op, key } => write!(f, "KEY {op} {key:?}"),
            Filter::ValueCompare { op, value } => write!(f, "VALUE {op} {value:?}"),
            Filter::KeyPrefix(prefix) => write!(f, "PREFIX({prefix:?})"),
        }
    }
}

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Keys ascending, compared segment by segment
    ByKey,
    /// Keys descending
    ByKeyDescending,
    /// Value bytes ascending
    ByValue,
    /// Value bytes descending
    ByValueDescending,
}

impl Order {
    /// Compare two entries under this order
    pub fn compare(self, a: &Entry, b: &Entry) -> Ordering {
        match self {
            Order::ByKey => compare_paths(&a.key, &b.key),
            Order::ByKeyDescending => compare_paths(&b.key, &a.key),
            Order::ByValue => a.value_bytes().cmp(b.value_bytes()),
            Order::ByValueDescending => b.value_bytes().cmp(a.value_bytes()),
        }
    }
}

/// Compare entries by each order in turn, falling back to key order
pub fn compare_entries(orders: &[Order], a: &Entry, b: &Entry) -> Ordering {
    orders
        .iter()
        .map(|order| order.compare(a, b))
        .find(|ordering| ordering.is_ne())
        .unwrap_or_else(|| compare_paths(&a.key, &b.key))
}

/// A query over the datastore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Only keys starting with this prefix
    pub prefix: String,
    /// Every filter must match
    pub filters: Vec<Filter>,
    /// Sort orders, applied in sequence
    pub orders: Vec<Order>,
    /// Maximum number of entries, 0 for no limit
    pub limit: usize,
    /// Entries to skip before the first returned one
    pub offset: usize,
    /// Return keys without values
    pub keys_only: bool,
    /// Populate [`Entry::size`]
    pub returns_sizes: bool,
}

impl Query {
    /// Query everything under `prefix`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Whether the query asks for ordering or filtering
    pub fn needs_local_processing(&self) -> bool {
        !self.orders.is_empty() || !self.filters.is_empty()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", if self.keys_only { "keys" } else { "entries" })?;
        if !self.prefix.is_empty() {
            write!(f, " FROM {:?}", self.prefix)?;
        }
        for (i, filter) in self.filters.iter().enumerate() {
            write!(f, "{} {filter}", if i == 0 { " FILTER" } else { " AND" })?;
        }
        if !self.orders.is_empty() {
            write!(f, " ORDER {:?}", self.orders)?;
        }
        if self.offset > 0 {
            write!(f, " OFFSET {}", self.offset)?;
        }
        if self.limit > 0 {
            write!(f, " LIMIT {}", self.limit)?;
        }
        Ok(())
    }
}

/// One query result entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    /// Key (bucket object name)
    pub key: String,
    /// Value, absent for keys-only queries
    pub value: Option<Bytes>,
    /// Value size in bytes, when requested
    pub size: Option<usize>,
}

impl Entry {
    /// Entry with only a key
    pub fn key_only(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    fn value_bytes(&self) -> &[u8] {
        self.value.as_deref().unwrap_or_default()
    }
}

/// Single query result
pub type QueryResult = DatastoreResult<Entry>;

/// Lazily produced query results.
///
/// Implements [`Stream`]; after an error no further results follow.
pub struct Results {
    query: Query,
    inner: BoxStream<'static, QueryResult>,
    task: Option<JoinHandle<()>>,
}

impl Results {
    /// Results read from `inner`, produced by `task`
    pub(crate) fn new(
        query: Query,
        inner: BoxStream<'static, QueryResult>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { query, inner, task }
    }

    /// Results from an arbitrary stream, with no background task
    pub fn from_stream<S>(query: Query, stream: S) -> Self
    where
        S: Stream<Item = QueryResult> + Send + 'static,
    {
        Self::new(query, stream.boxed(), None)
    }

    /// Results over already materialized entries
    pub fn from_entries(query: Query, entries: Vec<Entry>) -> Self {
        Self::from_stream(query, stream::iter(entries.into_iter().map(Ok)))
    }

    /// The query these results answer
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Collect every remaining entry, stopping at the first error
    pub async fn rest(mut self) -> DatastoreResult<Vec<Entry>> {
        let mut entries = Vec::new();
        while let Some(result) = self.inner.next().await {
            entries.push(result?);
        }
        Ok(entries)
    }

    /// Stop producing results and release backend resources
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // the join error for an aborted task carries nothing useful
            let _ = task.await;
        }
    }
}

impl Stream for Results {
    type Item = QueryResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for Results {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Results")
            .field("query", &self.query)
            .field("running", &self.task.as_ref().map(|t| !t.is_finished()))
            .finish_non_exhaustive()
    }
}

/// Reject a query shape the caller's mode cannot serve
pub(crate) fn unsupported(query: &Query) -> DatastoreError {
    DatastoreError::UnsupportedQuery {
        reason: format!("filters or orders are not supported: {query}"),
    }
}
