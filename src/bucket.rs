//! `LeakyBucket`: a stateless facade binding `{key, capacity, leak_rate}` to
//! a storage adapter.

use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::storage::{BucketState, ConditionalBucketState, Storage};

/// A leaky bucket bound to one key and one storage adapter.
///
/// Holds no state of its own beyond the key/capacity/leak_rate triple —
/// every read or write goes straight through to `storage`. Construct via
/// [`LeakyBucket::new`] (explicit `leak_rate`) or
/// [`LeakyBucket::with_over_time`] (derive `leak_rate` from a drain
/// duration); the two are mutually exclusive by construction rather than by
/// a runtime flag.
#[derive(Debug, Clone)]
pub struct LeakyBucket<S> {
    key: String,
    capacity: f64,
    leak_rate: f64,
    storage: S,
}

impl<S: Storage> LeakyBucket<S> {
    /// Build a bucket with an explicit leak rate (tokens/second).
    pub fn new(key: impl Into<String>, capacity: f64, leak_rate: f64, storage: S) -> Result<Self> {
        if capacity <= 0.0 {
            return Err(ConfigError::InvalidCapacity(capacity).into());
        }
        if leak_rate <= 0.0 {
            return Err(ConfigError::InvalidLeakRate(leak_rate).into());
        }
        Ok(Self {
            key: key.into(),
            capacity,
            leak_rate,
            storage,
        })
    }

    /// Build a bucket whose leak rate is derived from a full-drain duration:
    /// `leak_rate = capacity / over_time`.
    pub fn with_over_time(
        key: impl Into<String>,
        capacity: f64,
        over_time: Duration,
        storage: S,
    ) -> Result<Self> {
        let seconds = over_time.as_secs_f64();
        if seconds <= 0.0 {
            return Err(ConfigError::InvalidLeakRate(0.0).into());
        }
        Self::new(key, capacity, capacity / seconds, storage)
    }

    /// The bucket's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The bucket's capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// The bucket's leak rate, in tokens/second.
    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    /// Read-only effective level, without mutating anything.
    pub async fn state(&self) -> Result<BucketState> {
        self.storage.state(&self.key, self.capacity, self.leak_rate).await
    }

    /// Unconditional fillup: always persists, clamped to `[0, capacity]`.
    pub async fn fillup(&self, n: f64) -> Result<BucketState> {
        self.storage
            .add_tokens(&self.key, self.capacity, self.leak_rate, n)
            .await
    }

    /// Conditional fillup: applies only if it would not exceed capacity.
    pub async fn fillup_conditionally(&self, n: f64) -> Result<ConditionalBucketState> {
        self.storage
            .add_tokens_conditionally(&self.key, self.capacity, self.leak_rate, n)
            .await
    }

    /// Advisory, racy-by-construction check: would `n` more tokens fit right now?
    ///
    /// Callers must not treat a `true` result as a guarantee — another
    /// caller may fill the bucket between this read and a subsequent write.
    pub async fn able_to_accept(&self, n: f64) -> Result<bool> {
        let state = self.state().await?;
        Ok(state.level + n <= self.capacity)
    }
}
