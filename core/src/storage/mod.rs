//! Pluggable key/value storage with metadata-indexed queries and
//! single-writer transactions.
//!
//! Backends store [`StorageItem`]s (JSON values wrapped with a timestamp and
//! optional metadata). The [`StorageSystem`] facade adds typed encode/decode
//! at the API edge, TTL expiry, and observability events on the bus.

mod file;
mod memory;
mod system;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use system::{StorageOptions, StorageSystem};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// A stored value with its write timestamp and optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageItem {
    pub key: String,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StorageItem {
    pub fn new(key: impl Into<String>, value: Value, metadata: Option<Map<String, Value>>) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Exact-match check of a metadata subset.
    pub(crate) fn metadata_matches(&self, wanted: &Map<String, Value>) -> bool {
        let Some(meta) = &self.metadata else {
            return false;
        };
        wanted.iter().all(|(k, v)| meta.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Key,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Filtering, sorting, and pagination options for `keys` and `query`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub prefix: Option<String>,
    /// Exact-match subset of item metadata.
    pub metadata: Option<Map<String, Value>>,
    pub from_timestamp: Option<DateTime<Utc>>,
    pub to_timestamp: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub sort_by: Option<SortBy>,
    pub sort_direction: SortDirection,
}

impl QueryOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }
}

/// Storage backend contract. At most one transaction may be open per backend
/// instance; while open, mutations land in a private shadow state invisible
/// to readers of other handles until commit.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn set(&self, key: &str, item: StorageItem) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Option<StorageItem>, StorageError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
    async fn keys(&self, options: &QueryOptions) -> Result<Vec<String>, StorageError>;
    async fn query(&self, options: &QueryOptions) -> Result<Vec<StorageItem>, StorageError>;
    async fn begin_transaction(&self) -> Result<(), StorageError>;
    async fn commit_transaction(&self) -> Result<(), StorageError>;
    async fn rollback_transaction(&self) -> Result<(), StorageError>;
}

/// Shared filtering/sorting/pagination applied by backends in `query`.
pub(crate) fn apply_query(mut items: Vec<StorageItem>, options: &QueryOptions) -> Vec<StorageItem> {
    if let Some(from) = options.from_timestamp {
        items.retain(|i| i.timestamp >= from);
    }
    if let Some(to) = options.to_timestamp {
        items.retain(|i| i.timestamp <= to);
    }
    if let Some(wanted) = &options.metadata {
        items.retain(|i| i.metadata_matches(wanted));
    }

    if let Some(sort_by) = options.sort_by {
        match sort_by {
            SortBy::Key => items.sort_by(|a, b| a.key.cmp(&b.key)),
            SortBy::Timestamp => items.sort_by_key(|i| i.timestamp),
        }
        if options.sort_direction == SortDirection::Descending {
            items.reverse();
        }
    }

    let offset = options.offset.unwrap_or(0);
    let limit = options.limit.unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}
