//! Storage for per-key, per-window usage counts.
//!
//! The [`QuotaStore`] trait is the narrow transactional seam the counter
//! talks to. [`MemoryQuotaStore`] implements it over a sharded map, where the
//! shard lock is held only for the duration of one check-and-increment.
//! [`SqliteQuotaStore`](super::SqliteQuotaStore) keeps the same rows on disk.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use super::sqlite::SqliteQuotaStore;
use crate::config::{StorageConfig, StoreBackend};
use crate::error::Result;

/// Identity of a usage row: the API key and the start of its window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// The API key being counted
    pub key: String,
    /// Window start (epoch seconds, floored to the window boundary)
    pub window_start: u64,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(key: &str, window_start: u64) -> Self {
        Self {
            key: key.to_string(),
            window_start,
        }
    }
}

/// One usage row as seen by audit and reporting code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageWindow {
    /// The API key
    pub key: String,
    /// Window start (epoch seconds)
    pub window_start: u64,
    /// Successful increments recorded in this window
    pub count: u64,
}

/// Result of a single atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The increment was recorded; `count` is the new stored value.
    Incremented {
        /// Count after the increment
        count: u64,
    },
    /// The increment would have passed the limit; nothing was recorded.
    Rejected {
        /// Count that remains stored
        count: u64,
    },
}

/// Trait for usage-count backends.
///
/// Implementations must make `check_and_increment` linearizable per
/// `(key, window_start)`: the read, compare and write happen as one step.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Increment the count for `(key, window_start)` if the result stays
    /// within `limit`; otherwise leave it untouched.
    async fn check_and_increment(
        &self,
        key: &str,
        window_start: u64,
        limit: u64,
    ) -> Result<StoreOutcome>;

    /// Read the stored count without modifying it. Missing rows read as zero.
    async fn current_count(&self, key: &str, window_start: u64) -> Result<u64>;

    /// Drop every row whose window started before `cutoff`. Returns how many were removed.
    async fn purge_before(&self, cutoff: u64) -> Result<usize>;

    /// All rows currently held, in no particular order.
    async fn windows(&self) -> Result<Vec<UsageWindow>>;
}

/// In-process usage store backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    counts: DashMap<WindowKey, u64>,
}

impl MemoryQuotaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of live rows.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn check_and_increment(
        &self,
        key: &str,
        window_start: u64,
        limit: u64,
    ) -> Result<StoreOutcome> {
        // The entry guard holds the shard's write lock until it is dropped.
        let mut count = self
            .counts
            .entry(WindowKey::new(key, window_start))
            .or_insert(0);

        if *count >= limit {
            return Ok(StoreOutcome::Rejected { count: *count });
        }

        *count += 1;
        Ok(StoreOutcome::Incremented { count: *count })
    }

    async fn current_count(&self, key: &str, window_start: u64) -> Result<u64> {
        Ok(self
            .counts
            .get(&WindowKey::new(key, window_start))
            .map(|count| *count)
            .unwrap_or(0))
    }

    async fn purge_before(&self, cutoff: u64) -> Result<usize> {
        let before = self.counts.len();
        self.counts.retain(|key, _| key.window_start >= cutoff);
        Ok(before.saturating_sub(self.counts.len()))
    }

    async fn windows(&self) -> Result<Vec<UsageWindow>> {
        Ok(self
            .counts
            .iter()
            .map(|entry| UsageWindow {
                key: entry.key().key.clone(),
                window_start: entry.key().window_start,
                count: *entry.value(),
            })
            .collect())
    }
}

/// The usage store chosen by process configuration.
#[derive(Debug)]
pub enum QuotaBackend {
    /// In-process sharded map
    Memory(MemoryQuotaStore),
    /// SQLite database file
    Sqlite(SqliteQuotaStore),
}

impl QuotaBackend {
    /// Open the backend named in `config`.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StoreBackend::Memory => Ok(QuotaBackend::Memory(MemoryQuotaStore::new())),
            StoreBackend::Sqlite => SqliteQuotaStore::open(config).map(QuotaBackend::Sqlite),
        }
    }
}

#[async_trait]
impl QuotaStore for QuotaBackend {
    async fn check_and_increment(
        &self,
        key: &str,
        window_start: u64,
        limit: u64,
    ) -> Result<StoreOutcome> {
        match self {
            QuotaBackend::Memory(store) => store.check_and_increment(key, window_start, limit).await,
            QuotaBackend::Sqlite(store) => store.check_and_increment(key, window_start, limit).await,
        }
    }

    async fn current_count(&self, key: &str, window_start: u64) -> Result<u64> {
        match self {
            QuotaBackend::Memory(store) => store.current_count(key, window_start).await,
            QuotaBackend::Sqlite(store) => store.current_count(key, window_start).await,
        }
    }

    async fn purge_before(&self, cutoff: u64) -> Result<usize> {
        match self {
            QuotaBackend::Memory(store) => store.purge_before(cutoff).await,
            QuotaBackend::Sqlite(store) => store.purge_before(cutoff).await,
        }
    }

    async fn windows(&self) -> Result<Vec<UsageWindow>> {
        match self {
            QuotaBackend::Memory(store) => store.windows().await,
            QuotaBackend::Sqlite(store) => store.windows().await,
        }
    }
}
