//! SQLite-backed usage store.
//!
//! Rows live in one `usage` table keyed by `(api_key, window_start)`. A
//! check-and-increment is a single upsert guarded by `count < limit`, run in
//! an immediate transaction, so writers on the same file serialize on the
//! database lock whether they share a process or not.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::store::{QuotaStore, StoreOutcome, UsageWindow};
use crate::config::StorageConfig;
use crate::error::{EdgeguardError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage (
    api_key      TEXT    NOT NULL,
    window_start INTEGER NOT NULL,
    count        INTEGER NOT NULL,
    PRIMARY KEY (api_key, window_start)
);";

const INCREMENT_BELOW_LIMIT: &str = "
INSERT INTO usage (api_key, window_start, count) VALUES (?1, ?2, 1)
ON CONFLICT (api_key, window_start) DO UPDATE SET count = count + 1 WHERE count < ?3
RETURNING count";

const SELECT_COUNT: &str = "SELECT count FROM usage WHERE api_key = ?1 AND window_start = ?2";

/// Usage store persisted in a SQLite database file.
///
/// One connection is shared by the process; every operation runs on the
/// blocking pool and holds the connection only for its own transaction.
#[derive(Debug, Clone)]
pub struct SqliteQuotaStore {
    connection: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteQuotaStore {
    /// Open the database named in `config`, creating file and table if needed.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::open_path(&config.path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// Open the database at `path`.
    pub fn open_path(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Err(EdgeguardError::config(
                path.display().to_string(),
                "usage store path is a directory",
            ));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(path, flags)?;
        connection.busy_timeout(busy_timeout)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        connection.execute_batch("PRAGMA synchronous = NORMAL;")?;
        connection.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened SQLite usage store");
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path: path.to_path_buf(),
        })
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        match tokio::task::spawn_blocking(move || op(&mut connection.lock())).await {
            Ok(outcome) => outcome,
            Err(e) => Err(std::io::Error::other(e).into()),
        }
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn check_and_increment(
        &self,
        key: &str,
        window_start: u64,
        limit: u64,
    ) -> Result<StoreOutcome> {
        let key = key.to_string();
        let window = to_sql(window_start);

        self.run(move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let incremented: Option<i64> = if limit == 0 {
                None
            } else {
                tx.query_row(INCREMENT_BELOW_LIMIT, params![key, window, to_sql(limit)], |row| {
                    row.get(0)
                })
                .optional()?
            };

            let outcome = match incremented {
                Some(count) => StoreOutcome::Incremented {
                    count: from_sql(count),
                },
                None => {
                    let count: Option<i64> = tx
                        .query_row(SELECT_COUNT, params![key, window], |row| row.get(0))
                        .optional()?;
                    StoreOutcome::Rejected {
                        count: count.map_or(0, from_sql),
                    }
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn current_count(&self, key: &str, window_start: u64) -> Result<u64> {
        let key = key.to_string();
        let window = to_sql(window_start);

        self.run(move |connection| {
            let count: Option<i64> = connection
                .query_row(SELECT_COUNT, params![key, window], |row| row.get(0))
                .optional()?;
            Ok(count.map_or(0, from_sql))
        })
        .await
    }

    async fn purge_before(&self, cutoff: u64) -> Result<usize> {
        let cutoff = to_sql(cutoff);

        self.run(move |connection| {
            let removed =
                connection.execute("DELETE FROM usage WHERE window_start < ?1", params![cutoff])?;
            debug!(removed = removed, "Deleted stale usage rows");
            Ok(removed)
        })
        .await
    }

    async fn windows(&self) -> Result<Vec<UsageWindow>> {
        self.run(|connection| {
            let mut stmt = connection.prepare("SELECT api_key, window_start, count FROM usage")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UsageWindow {
                        key: row.get(0)?,
                        window_start: from_sql(row.get(1)?),
                        count: from_sql(row.get(2)?),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_in(dir: &TempDir) -> SqliteQuotaStore {
        SqliteQuotaStore::open_path(dir.path().join("usage.db"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_increment_then_reject_at_limit() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);

        assert_eq!(
            store.check_and_increment("k", 60, 2).await.unwrap(),
            StoreOutcome::Incremented { count: 1 }
        );
        assert_eq!(
            store.check_and_increment("k", 60, 2).await.unwrap(),
            StoreOutcome::Incremented { count: 2 }
        );
        assert_eq!(
            store.check_and_increment("k", 60, 2).await.unwrap(),
            StoreOutcome::Rejected { count: 2 }
        );
        assert_eq!(store.current_count("k", 60).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);

        assert_eq!(
            store.check_and_increment("k", 60, 0).await.unwrap(),
            StoreOutcome::Rejected { count: 0 }
        );
        assert!(store.windows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_in(&dir);
            store.check_and_increment("k", 120, 5).await.unwrap();
            store.check_and_increment("k", 120, 5).await.unwrap();
        }

        let reopened = open_in(&dir);
        assert_eq!(reopened.current_count("k", 120).await.unwrap(), 2);
        assert_eq!(
            reopened.check_and_increment("k", 120, 5).await.unwrap(),
            StoreOutcome::Incremented { count: 3 }
        );
    }

    #[tokio::test]
    async fn test_purge_before_and_windows() {
        let dir = TempDir::new().unwrap();
        let store = open_in(&dir);
        store.check_and_increment("a", 0, 5).await.unwrap();
        store.check_and_increment("a", 60, 5).await.unwrap();
        store.check_and_increment("b", 120, 5).await.unwrap();

        assert_eq!(store.purge_before(60).await.unwrap(), 1);

        let mut rows = store.windows().await.unwrap();
        rows.sort_by_key(|row| row.window_start);
        assert_eq!(
            rows,
            vec![
                UsageWindow {
                    key: "a".to_string(),
                    window_start: 60,
                    count: 1
                },
                UsageWindow {
                    key: "b".to_string(),
                    window_start: 120,
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_directory_path_rejected() {
        let dir = TempDir::new().unwrap();
        let err = SqliteQuotaStore::open_path(dir.path(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EdgeguardError::Config { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_connections_never_exceed_limit() {
        let dir = TempDir::new().unwrap();
        // Two independent connections contend on the same database file.
        let stores = [Arc::new(open_in(&dir)), Arc::new(open_in(&dir))];
        let limit = 50;

        let mut handles = Vec::new();
        for worker in 0..16 {
            let store = stores[worker % 2].clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0u64;
                for _ in 0..20 {
                    if let StoreOutcome::Incremented { .. } =
                        store.check_and_increment("shared", 600, limit).await.unwrap()
                    {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }

        assert_eq!(total, limit);
        assert_eq!(stores[0].current_count("shared", 600).await.unwrap(), limit);
    }
}
