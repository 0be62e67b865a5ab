//! Storage adapter trait and implementations.
//!
//! This module defines the [`Storage`] trait that every backend must
//! implement: a small, atomic set of operations realizing the leaky-bucket
//! level update and the block registry on top of a specific store.
//!
//! All operations that mutate state (`add_tokens`,
//! `add_tokens_conditionally`, `set_block`) must commit their
//! read-modify-write as a single atomic step against the backing store —
//! see each adapter's module docs for how it achieves that.

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::{GcInterval, MemoryAdapter, MemoryAdapterConfig};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresAdapter, PostgresConfig};
#[cfg(feature = "redis")]
pub use redis::{RedisAdapter, RedisConfig};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteAdapter, SqliteConfig};

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// The effective level of a bucket at the moment an operation completed.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketState {
    /// Effective level after leaking and (if applicable) filling up.
    pub level: f64,
    /// `true` iff `level >= capacity` (strict, per the uniform convention
    /// this crate picks among the two seen in the source material).
    pub at_capacity: bool,
}

impl BucketState {
    /// Build a state from a level and capacity, deriving `at_capacity`.
    pub fn from_level(level: f64, capacity: f64) -> Self {
        Self {
            level,
            at_capacity: level >= capacity,
        }
    }
}

/// The result of a conditional fillup: the post-operation state plus
/// whether the fillup was actually applied.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConditionalBucketState {
    /// Effective level after the operation (post-fillup if accepted, post-leak-only otherwise).
    pub level: f64,
    /// `true` iff `level >= capacity`.
    pub at_capacity: bool,
    /// `true` iff the fillup was applied (the request would not have overflowed).
    pub accepted: bool,
}

impl ConditionalBucketState {
    pub(crate) fn new(level: f64, capacity: f64, accepted: bool) -> Self {
        Self {
            level,
            at_capacity: level >= capacity,
            accepted,
        }
    }
}

/// Storage backend trait for leaky-bucket and block state.
///
/// Implementations must be thread-safe (`Send + Sync`) and must serialize
/// concurrent operations on the same key into a total order — see spec §5.
/// Operations on distinct keys make no ordering promise relative to each
/// other.
pub trait Storage: Send + Sync + 'static {
    /// Read-only: the effective level right now, without mutating anything.
    ///
    /// Returns `(0.0, false)` (via [`BucketState::from_level`]) if the key
    /// has no bucket row.
    fn state(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
    ) -> impl Future<Output = Result<BucketState>> + Send;

    /// Unconditional fillup: leak, then clamp `pre + n` into `[0, capacity]`
    /// and persist it, regardless of whether it would have overflowed.
    fn add_tokens(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> impl Future<Output = Result<BucketState>> + Send;

    /// Conditional fillup: leak, then only apply `pre + n` if it would not
    /// exceed `capacity`. The leaked pre-level is always persisted, whether
    /// or not the fillup itself is accepted.
    fn add_tokens_conditionally(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> impl Future<Output = Result<ConditionalBucketState>> + Send;

    /// Install or extend a block: the resulting `blocked_until` is the max
    /// of the existing value (if any) and `now + block_for`.
    ///
    /// Fails with [`crate::error::ConfigError::InvalidBlockDuration`] when
    /// `block_for` is not strictly positive.
    fn set_block(
        &self,
        key: &str,
        block_for: Duration,
    ) -> impl Future<Output = Result<DateTime<Utc>>> + Send;

    /// The stored `blocked_until` for `key`, iff it is strictly in the future.
    fn blocked_until(&self, key: &str) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Delete expired bucket rows and lapsed blocks. Idempotent; safe to run
    /// concurrently with live traffic.
    fn prune(&self) -> impl Future<Output = Result<()>> + Send;

    /// Adapter-specific schema initialization. No-op for memory/Redis.
    fn create_tables(&self) -> impl Future<Output = Result<()>> + Send;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
        (**self).state(key, capacity, leak_rate).await
    }

    async fn add_tokens(&self, key: &str, capacity: f64, leak_rate: f64, n: f64) -> Result<BucketState> {
        (**self).add_tokens(key, capacity, leak_rate, n).await
    }

    async fn add_tokens_conditionally(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> Result<ConditionalBucketState> {
        (**self)
            .add_tokens_conditionally(key, capacity, leak_rate, n)
            .await
    }

    async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
        (**self).set_block(key, block_for).await
    }

    async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        (**self).blocked_until(key).await
    }

    async fn prune(&self) -> Result<()> {
        (**self).prune().await
    }

    async fn create_tables(&self) -> Result<()> {
        (**self).create_tables().await
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
        (**self).state(key, capacity, leak_rate).await
    }

    async fn add_tokens(&self, key: &str, capacity: f64, leak_rate: f64, n: f64) -> Result<BucketState> {
        (**self).add_tokens(key, capacity, leak_rate, n).await
    }

    async fn add_tokens_conditionally(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> Result<ConditionalBucketState> {
        (**self)
            .add_tokens_conditionally(key, capacity, leak_rate, n)
            .await
    }

    async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
        (**self).set_block(key, block_for).await
    }

    async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        (**self).blocked_until(key).await
    }

    async fn prune(&self) -> Result<()> {
        (**self).prune().await
    }

    async fn create_tables(&self) -> Result<()> {
        (**self).create_tables().await
    }
}

/// Derive the `may_be_deleted_after`/TTL horizon for a bucket: twice the
/// time it would take to drain a full bucket, per spec §3.
pub(crate) fn deletion_horizon(capacity: f64, leak_rate: f64) -> Duration {
    Duration::from_secs_f64(2.0 * capacity / leak_rate)
}

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Object-safe erasure of [`Storage`].
///
/// `Storage`'s methods return `impl Future` (async-fn-in-trait), which makes
/// `Storage` itself unable to form a `dyn Storage` — the compiler cannot
/// build a vtable for a method whose return type isn't fixed-size. Anything
/// that needs a type-erased adapter (the process-wide default-adapter
/// registry in [`crate::config`]) goes through this trait instead, whose
/// methods box the future explicitly so a vtable is possible. Blanket
/// implemented for every `T: Storage`; callers never implement it by hand.
pub trait DynStorage: Send + Sync + 'static {
    fn state<'a>(&'a self, key: &'a str, capacity: f64, leak_rate: f64) -> BoxFuture<'a, BucketState>;

    fn add_tokens<'a>(&'a self, key: &'a str, capacity: f64, leak_rate: f64, n: f64) -> BoxFuture<'a, BucketState>;

    fn add_tokens_conditionally<'a>(
        &'a self,
        key: &'a str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> BoxFuture<'a, ConditionalBucketState>;

    fn set_block<'a>(&'a self, key: &'a str, block_for: Duration) -> BoxFuture<'a, DateTime<Utc>>;

    fn blocked_until<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<DateTime<Utc>>>;

    fn prune<'a>(&'a self) -> BoxFuture<'a, ()>;

    fn create_tables<'a>(&'a self) -> BoxFuture<'a, ()>;
}

impl<T: Storage> DynStorage for T {
    fn state<'a>(&'a self, key: &'a str, capacity: f64, leak_rate: f64) -> BoxFuture<'a, BucketState> {
        Box::pin(Storage::state(self, key, capacity, leak_rate))
    }

    fn add_tokens<'a>(&'a self, key: &'a str, capacity: f64, leak_rate: f64, n: f64) -> BoxFuture<'a, BucketState> {
        Box::pin(Storage::add_tokens(self, key, capacity, leak_rate, n))
    }

    fn add_tokens_conditionally<'a>(
        &'a self,
        key: &'a str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> BoxFuture<'a, ConditionalBucketState> {
        Box::pin(Storage::add_tokens_conditionally(self, key, capacity, leak_rate, n))
    }

    fn set_block<'a>(&'a self, key: &'a str, block_for: Duration) -> BoxFuture<'a, DateTime<Utc>> {
        Box::pin(Storage::set_block(self, key, block_for))
    }

    fn blocked_until<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(Storage::blocked_until(self, key))
    }

    fn prune<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Storage::prune(self))
    }

    fn create_tables<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Storage::create_tables(self))
    }
}

/// Lets a type-erased adapter (`Arc<dyn DynStorage>`, as held by the default-
/// adapter registry) be used anywhere a `Storage` is expected, e.g. as the
/// `S` in `Throttle<S>`.
impl Storage for std::sync::Arc<dyn DynStorage> {
    async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
        DynStorage::state(self.as_ref(), key, capacity, leak_rate).await
    }

    async fn add_tokens(&self, key: &str, capacity: f64, leak_rate: f64, n: f64) -> Result<BucketState> {
        DynStorage::add_tokens(self.as_ref(), key, capacity, leak_rate, n).await
    }

    async fn add_tokens_conditionally(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> Result<ConditionalBucketState> {
        DynStorage::add_tokens_conditionally(self.as_ref(), key, capacity, leak_rate, n).await
    }

    async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
        DynStorage::set_block(self.as_ref(), key, block_for).await
    }

    async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        DynStorage::blocked_until(self.as_ref(), key).await
    }

    async fn prune(&self) -> Result<()> {
        DynStorage::prune(self.as_ref()).await
    }

    async fn create_tables(&self) -> Result<()> {
        DynStorage::create_tables(self.as_ref()).await
    }
}
