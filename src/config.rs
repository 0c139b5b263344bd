//! Datastore configuration

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// Configuration constants
pub mod constants {
    //! Constants used throughout the crate

    /// Keys requested per listing page from paginated backends
    pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

    /// Query results buffered between the producer task and the consumer.
    ///
    /// One slot makes the channel a hand-off: the producer runs at most one
    /// entry ahead of the caller.
    pub const DEFAULT_RESULT_BUFFER: usize = 1;
}

/// How [`crate::BlobDatastore::query`] serves a query.
///
/// The two modes trade differently: `Strict` never reads more from the
/// backend than the caller consumes but cannot order or filter, while `Naive`
/// supports every query shape by reading each prefix-matching object (and its
/// bytes, unless the query is keys-only) before ordering and filtering
/// locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde_support", serde(rename_all = "snake_case"))]
pub enum QueryMode {
    /// Backend prefix listing, client-side offset and limit; orders and
    /// filters are rejected
    #[default]
    Strict,
    /// List everything under the prefix and apply the whole query locally
    Naive,
}

/// Datastore configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde_support", serde(default))]
pub struct DatastoreConfig {
    /// Query execution strategy
    pub query_mode: QueryMode,
    /// Capacity of the channel feeding query results to the caller
    pub result_buffer: usize,
    /// Page size hint passed to bucket listings
    pub list_page_size: usize,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            query_mode: QueryMode::Strict,
            result_buffer: constants::DEFAULT_RESULT_BUFFER,
            list_page_size: constants::DEFAULT_LIST_PAGE_SIZE,
        }
    }
}

impl DatastoreConfig {
    /// Default configuration with the given query mode
    pub fn with_query_mode(query_mode: QueryMode) -> Self {
        Self {
            query_mode,
            ..Default::default()
        }
    }

    /// Reject values the datastore cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.result_buffer == 0 {
            return Err(crate::Error::Configuration {
                message: "result_buffer must be at least 1".to_string(),
            });
        }
        if self.list_page_size == 0 {
            return Err(crate::Error::Configuration {
                message: "list_page_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
