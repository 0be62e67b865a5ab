//! SQLite storage backend.
//!
//! Unlike Postgres, SQLite has no `clock_timestamp()`-style function usable
//! inside an upsert's RETURNING expression, so the leak/fillup math runs as
//! an explicit two-statement protocol inside one transaction: a `SELECT` to
//! read the current row, the leak/accept decision computed in Rust, then an
//! `INSERT ... ON CONFLICT DO UPDATE` that persists it. The transaction
//! (SQLite serializes writers per-file) gives the same atomicity the other
//! adapters get from a single statement — see spec §4.1's open question on
//! this backend.
//!
//! `rusqlite` is synchronous, so every operation runs inside
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::error::{ConfigError, ConnectionError, Result, StorageError};
use crate::storage::{deletion_horizon, BucketState, ConditionalBucketState, Storage};

const SCHEMA_SQL: &str = include_str!("schema/sqlite.sql");

/// SQLite storage configuration.
#[derive(Debug, Clone)]
pub enum SqliteConfig {
    /// A file-backed database at the given path.
    File(std::path::PathBuf),
    /// A private in-memory database, scoped to the pool (one connection would
    /// see an empty database each time without `Mode::Memory` shared-cache
    /// semantics, so this variant is mainly useful with a pool size of 1).
    Memory,
}

impl SqliteConfig {
    /// Configure a file-backed database.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }
}

/// SQLite-backed storage adapter.
pub struct SqliteAdapter {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter").finish()
    }
}

impl SqliteAdapter {
    /// Build a new adapter with a default-sized pool.
    pub fn new(config: SqliteConfig) -> Result<Self> {
        Self::with_pool_size(config, 8)
    }

    /// Build a new adapter with an explicit pool size.
    pub fn with_pool_size(config: SqliteConfig, pool_size: u32) -> Result<Self> {
        let manager = match config {
            SqliteConfig::File(path) => SqliteConnectionManager::file(path),
            SqliteConfig::Memory => SqliteConnectionManager::memory(),
        };

        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StorageError::operation_failed(e.to_string(), true))?;
            f(&mut conn).map_err(|e| StorageError::operation_failed(e.to_string(), true).into())
        })
        .await
        .map_err(|e| StorageError::operation_failed(e.to_string(), true).into())?
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn secs_to_datetime(secs: f64) -> Result<DateTime<Utc>> {
    let whole = secs.trunc() as i64;
    let nanos = (secs.fract() * 1_000_000_000.0) as u32;
    DateTime::<Utc>::from_timestamp(whole, nanos)
        .ok_or_else(|| StorageError::Serialization("timestamp out of range".into()).into())
}

fn fillup_tx(
    conn: &mut Connection,
    key: &str,
    capacity: f64,
    leak_rate: f64,
    n: f64,
    conditional: bool,
    now: f64,
    horizon_secs: f64,
) -> rusqlite::Result<(f64, bool)> {
    // Immediate: take the write lock at BEGIN rather than upgrading a shared
    // read lock at the INSERT, so two concurrent callers on the same key
    // serialize instead of racing SQLITE_BUSY on the upgrade.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let row: Option<(f64, f64)> = tx
        .query_row(
            "SELECT level, last_touched FROM leaky_buckets WHERE key = ?1",
            params![key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let pre = match row {
        Some((level, last_touched)) => {
            let elapsed = (now - last_touched).max(0.0);
            (level - elapsed * leak_rate).clamp(0.0, capacity)
        }
        None => 0.0,
    };

    let would = pre + n;
    let accepted = if conditional { would <= capacity } else { true };
    let post = if accepted { would.clamp(0.0, capacity) } else { pre };

    tx.execute(
        "INSERT INTO leaky_buckets (id, key, level, last_touched, may_be_deleted_after)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(key) DO UPDATE SET
             level = excluded.level,
             last_touched = excluded.last_touched,
             may_be_deleted_after = excluded.may_be_deleted_after",
        params![Uuid::new_v4().to_string(), key, post, now, now + horizon_secs],
    )?;

    tx.commit()?;
    Ok((post, accepted))
}

fn set_block_tx(conn: &mut Connection, key: &str, now: f64, block_for_secs: f64) -> rusqlite::Result<f64> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<f64> = tx
        .query_row(
            "SELECT blocked_until FROM blocks WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()?;

    let proposed = now + block_for_secs;
    let resulting = match existing {
        Some(e) if e > proposed => e,
        _ => proposed,
    };

    tx.execute(
        "INSERT INTO blocks (id, key, blocked_until) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET blocked_until = excluded.blocked_until",
        params![Uuid::new_v4().to_string(), key, resulting],
    )?;

    tx.commit()?;
    Ok(resulting)
}

impl Storage for SqliteAdapter {
    async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
        let key = key.to_string();
        let now = now_secs();

        let level = self
            .run_blocking(move |conn| {
                let row: Option<(f64, f64)> = conn
                    .query_row(
                        "SELECT level, last_touched FROM leaky_buckets WHERE key = ?1",
                        params![key],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;

                Ok(match row {
                    Some((level, last_touched)) => {
                        let elapsed = (now - last_touched).max(0.0);
                        (level - elapsed * leak_rate).clamp(0.0, capacity)
                    }
                    None => 0.0,
                })
            })
            .await?;

        Ok(BucketState::from_level(level, capacity))
    }

    async fn add_tokens(&self, key: &str, capacity: f64, leak_rate: f64, n: f64) -> Result<BucketState> {
        let key = key.to_string();
        let now = now_secs();
        let horizon = deletion_horizon(capacity, leak_rate).as_secs_f64();

        let (level, _accepted) = self
            .run_blocking(move |conn| fillup_tx(conn, &key, capacity, leak_rate, n, false, now, horizon))
            .await?;

        Ok(BucketState::from_level(level, capacity))
    }

    async fn add_tokens_conditionally(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> Result<ConditionalBucketState> {
        let key = key.to_string();
        let now = now_secs();
        let horizon = deletion_horizon(capacity, leak_rate).as_secs_f64();

        let (level, accepted) = self
            .run_blocking(move |conn| fillup_tx(conn, &key, capacity, leak_rate, n, true, now, horizon))
            .await?;

        Ok(ConditionalBucketState::new(level, capacity, accepted))
    }

    async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
        if block_for.is_zero() {
            return Err(ConfigError::InvalidBlockDuration(block_for).into());
        }

        let key = key.to_string();
        let now = now_secs();
        let block_for_secs = block_for.as_secs_f64();

        let resulting = self
            .run_blocking(move |conn| set_block_tx(conn, &key, now, block_for_secs))
            .await?;

        secs_to_datetime(resulting)
    }

    async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let key = key.to_string();
        let now = now_secs();

        let value = self
            .run_blocking(move |conn| {
                conn.query_row(
                    "SELECT blocked_until FROM blocks WHERE key = ?1",
                    params![key],
                    |r| r.get::<_, f64>(0),
                )
                .optional()
            })
            .await?;

        match value {
            Some(secs) if secs > now => Ok(Some(secs_to_datetime(secs)?)),
            _ => Ok(None),
        }
    }

    async fn prune(&self) -> Result<()> {
        let now = now_secs();
        self.run_blocking(move |conn| {
            conn.execute("DELETE FROM leaky_buckets WHERE may_be_deleted_after < ?1", params![now])?;
            conn.execute("DELETE FROM blocks WHERE blocked_until < ?1", params![now])?;
            Ok(())
        })
        .await
    }

    async fn create_tables(&self) -> Result<()> {
        self.run_blocking(|conn| conn.execute_batch(SCHEMA_SQL)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::with_pool_size(SqliteConfig::Memory, 1).unwrap();
        adapter.create_tables().await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_state_empty() {
        let a = adapter().await;
        let s = a.state("k", 10.0, 1.0).await.unwrap();
        assert_eq!(s.level, 0.0);
    }

    #[tokio::test]
    async fn test_add_tokens_persists() {
        let a = adapter().await;
        let s = a.add_tokens("k", 10.0, 1.0, 4.0).await.unwrap();
        assert_eq!(s.level, 4.0);
        let s2 = a.state("k", 10.0, 1.0).await.unwrap();
        assert!(s2.level <= 4.0);
    }

    #[tokio::test]
    async fn test_conditional_rejects_overflow() {
        let a = adapter().await;
        a.add_tokens("k", 5.0, 1.0, 4.0).await.unwrap();
        let r = a.add_tokens_conditionally("k", 5.0, 1.0, 3.0).await.unwrap();
        assert!(!r.accepted);
        assert_eq!(r.level, 4.0);
    }

    #[tokio::test]
    async fn test_set_block_idempotent_under_max() {
        let a = adapter().await;
        let first = a.set_block("k", Duration::from_secs(10)).await.unwrap();
        let second = a.set_block("k", Duration::from_secs(2)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_set_block_rejects_zero_duration() {
        let a = adapter().await;
        assert!(a.set_block("k", Duration::ZERO).await.is_err());
    }
}
