//! Per-key quota accounting over fixed windows.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::Clock;
use super::store::{MemoryQuotaStore, QuotaStore, StoreOutcome};
use super::window::TimeWindow;
use crate::error::Result;

/// Outcome of [`QuotaCounter::check_and_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    /// One unit was consumed.
    Allowed {
        /// Count in the current window after this call
        used: u64,
        /// Units left in the current window
        remaining: u64,
    },
    /// The window is exhausted; nothing was consumed.
    LimitExceeded {
        /// Time until the next window opens
        reset_after: Duration,
    },
    /// The limit is zero; storage was not consulted.
    TierDisabled,
}

/// Counts requests per API key in fixed, epoch-aligned windows.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct QuotaCounter<S: QuotaStore = MemoryQuotaStore> {
    /// Backing store for usage rows
    store: S,
    /// Time source for window computation
    clock: Arc<dyn Clock>,
    /// Window length
    window: TimeWindow,
    /// How many past windows to keep before rows become collectable
    retention_windows: u64,
}

impl<S: QuotaStore> QuotaCounter<S> {
    /// Create a counter over an explicit store and clock.
    pub fn with_store(
        store: S,
        clock: Arc<dyn Clock>,
        window: TimeWindow,
        retention_windows: u64,
    ) -> Self {
        Self {
            store,
            clock,
            window,
            retention_windows: retention_windows.max(1),
        }
    }

    /// Consume one unit of `key`'s quota if the current window has room.
    ///
    /// A store failure consumes nothing and is returned to the caller.
    pub async fn check_and_increment(&self, key: &str, limit: u64) -> Result<QuotaOutcome> {
        if limit == 0 {
            return Ok(QuotaOutcome::TierDisabled);
        }

        let now = self.clock.now_secs();
        let window_start = self.window.start_of(now);

        trace!(key = %key, window = window_start, limit = limit, "Checking quota");

        let outcome = match self.store.check_and_increment(key, window_start, limit).await? {
            StoreOutcome::Incremented { count } => QuotaOutcome::Allowed {
                used: count,
                remaining: limit.saturating_sub(count),
            },
            StoreOutcome::Rejected { count } => {
                debug!(
                    key = %key,
                    window = window_start,
                    count = count,
                    limit = limit,
                    "Quota exhausted"
                );
                QuotaOutcome::LimitExceeded {
                    reset_after: self.window.reset_after(now),
                }
            }
        };
        Ok(outcome)
    }

    /// Units already consumed by `key` in the current window. Read-only.
    pub async fn used_in_window(&self, key: &str) -> Result<u64> {
        let window_start = self.current_window_start();
        self.store.current_count(key, window_start).await
    }

    /// `max(limit - used, 0)` for the current window. Read-only.
    pub async fn remaining_in_window(&self, key: &str, limit: u64) -> Result<u64> {
        Ok(limit.saturating_sub(self.used_in_window(key).await?))
    }

    /// Start of the window the clock currently falls in.
    pub fn current_window_start(&self) -> u64 {
        self.window.start_of(self.clock.now_secs())
    }

    /// Time until the current window rolls over.
    pub fn reset_after(&self) -> Duration {
        self.window.reset_after(self.clock.now_secs())
    }

    /// Get the backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Remove usage rows older than the retention horizon.
    pub async fn purge_stale(&self) -> Result<usize> {
        let horizon = self.retention_windows.saturating_mul(self.window.as_secs());
        let cutoff = self.current_window_start().saturating_sub(horizon);
        let removed = self.store.purge_before(cutoff).await?;
        if removed > 0 {
            info!(removed = removed, cutoff = cutoff, "Purged stale usage windows");
        }
        Ok(removed)
    }
}
