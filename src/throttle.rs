//! `Throttle`: composes a [`LeakyBucket`] and a [`Block`] under one key,
//! implementing the overflow-arms-a-block protocol.
//!
//! Two successive adapter calls (`blocked_until` then `fillup_conditionally`
//! then, on overflow, `set_block`) are not jointly atomic — see spec §5. The
//! design is correct anyway because `set_block` is idempotent under `max`
//! and because an installed block dominates subsequent bucket reads,
//! regardless of which concurrent caller's `set_block` lands last.
//!
//! Transactional coupling caveat (spec §7): if a caller wraps `request` in
//! an outer transaction that later rolls back, any write this call made to
//! a transactional SQL adapter rolls back with it. Call the throttle outside
//! the transaction if the rate-limit effect must persist regardless.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::block::Block;
use crate::bucket::LeakyBucket;
use crate::error::{ConfigError, RateLimitError, Result};
use crate::storage::Storage;

/// The outcome of a throttle request: either unblocked, or blocked until a
/// specific moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct State {
    /// The moment the block lapses, if one is active.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl State {
    /// No block in effect.
    pub const fn unblocked() -> Self {
        Self { blocked_until: None }
    }

    /// `true` iff a block is installed and still in the future. This
    /// predicate reads no store state, so a cached `State` can be checked
    /// (and naturally expire) without a round trip.
    pub fn blocked(&self) -> bool {
        self.blocked_until.is_some_and(|t| t > Utc::now())
    }
}

/// Raised by [`Throttle::request_or_raise`] when a request is blocked.
///
/// Not a variant of [`RateLimitError`] — this is the domain signal for "this
/// request is refused", distinct from an operational/storage failure.
#[derive(Debug, Clone)]
pub struct Throttled {
    /// The key that was blocked.
    pub key: String,
    /// The blocked state that triggered this.
    pub state: State,
}

impl Throttled {
    /// Seconds remaining until the block lapses, rounded up. Zero if the
    /// block has already lapsed by the time this is read.
    pub fn retry_after(&self) -> u64 {
        let Some(until) = self.state.blocked_until else {
            return 0;
        };
        let remaining_ms = (until - Utc::now()).num_milliseconds().max(0);
        (remaining_ms as f64 / 1000.0).ceil() as u64
    }
}

impl std::fmt::Display for Throttled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "throttled on key {:?}, retry after {}s", self.key, self.retry_after())
    }
}

impl std::error::Error for Throttled {}

/// Error type for [`Throttle::request_or_raise`]: either the domain signal
/// ([`Throttled`]) or an operational failure from the storage layer.
#[derive(Debug)]
pub enum RequestError {
    /// The request was refused by an active block.
    Throttled(Throttled),
    /// An operational error occurred talking to the storage adapter.
    RateLimit(RateLimitError),
}

impl From<RateLimitError> for RequestError {
    fn from(err: RateLimitError) -> Self {
        Self::RateLimit(err)
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Throttled(t) => write!(f, "{t}"),
            Self::RateLimit(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Throttled(t) => Some(t),
            Self::RateLimit(e) => Some(e),
        }
    }
}

/// Composite rate limiter: a bucket plus a block registry, under one key.
///
/// Holds the storage adapter behind an `Arc` so the bucket and block
/// registry can share one adapter instance without requiring `S: Clone` —
/// adapters like [`crate::storage::MemoryAdapter`] hold their state directly
/// (a `DashMap`) and must not be duplicated by cloning.
pub struct Throttle<S> {
    key: String,
    bucket: LeakyBucket<Arc<S>>,
    block: Block<Arc<S>>,
    block_for: Duration,
}

impl<S: Storage> Throttle<S> {
    /// Start building a throttle for `key`.
    pub fn builder(key: impl Into<String>) -> ThrottleBuilder<S> {
        ThrottleBuilder::new(key)
    }

    /// The throttle's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `blocked_until(key) == none && bucket.able_to_accept(n)`. Advisory only.
    pub async fn able_to_accept(&self, n: f64) -> Result<bool> {
        if self.block.blocked_until(&self.key).await?.is_some() {
            return Ok(false);
        }
        self.bucket.able_to_accept(n).await
    }

    /// Request `n` tokens. Never raises on a refusal — see
    /// [`Throttle::request_or_raise`] for that.
    pub async fn request(&self, n: f64) -> Result<State> {
        if let Some(until) = self.block.blocked_until(&self.key).await? {
            return Ok(State {
                blocked_until: Some(until),
            });
        }

        let r = self.bucket.fillup_conditionally(n).await?;
        if r.accepted {
            return Ok(State::unblocked());
        }

        let until = self.block.set(&self.key, self.block_for).await?;
        Ok(State { blocked_until: until })
    }

    /// Convenience for `request(1.0)`.
    pub async fn request_one(&self) -> Result<State> {
        self.request(1.0).await
    }

    /// As [`Throttle::request`], but raises [`Throttled`] when the
    /// resulting state is blocked.
    pub async fn request_or_raise(&self, n: f64) -> std::result::Result<State, RequestError> {
        let state = self.request(n).await?;
        if state.blocked() {
            Err(RequestError::Throttled(Throttled {
                key: self.key.clone(),
                state,
            }))
        } else {
            Ok(state)
        }
    }

    /// Run `body` only if a single-token request is accepted; otherwise do
    /// nothing and return `Ok(None)`. A prefix guard.
    pub async fn throttled<F, Fut, T>(&self, body: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let state = self.request(1.0).await?;
        if state.blocked() {
            return Ok(None);
        }
        Ok(Some(body().await))
    }
}

/// Builder for [`Throttle`], mirroring the teacher's manager-builder pattern.
pub struct ThrottleBuilder<S> {
    key: String,
    capacity: Option<f64>,
    leak_rate: Option<f64>,
    over_time: Option<Duration>,
    block_for: Option<Duration>,
    storage: Option<S>,
}

impl<S: Storage> ThrottleBuilder<S> {
    /// Start a builder for `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            capacity: None,
            leak_rate: None,
            over_time: None,
            block_for: None,
            storage: None,
        }
    }

    /// Set the bucket capacity.
    pub fn capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set an explicit leak rate. Mutually exclusive with `over_time`.
    pub fn leak_rate(mut self, leak_rate: f64) -> Self {
        self.leak_rate = Some(leak_rate);
        self
    }

    /// Derive the leak rate from a full-drain duration. Mutually exclusive
    /// with `leak_rate`.
    pub fn over_time(mut self, over_time: Duration) -> Self {
        self.over_time = Some(over_time);
        self
    }

    /// Override the default block duration (`capacity / leak_rate`).
    pub fn block_for(mut self, block_for: Duration) -> Self {
        self.block_for = Some(block_for);
        self
    }

    /// Set the storage adapter.
    pub fn storage(mut self, storage: S) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate and build the throttle.
    pub fn build(self) -> Result<Throttle<S>> {
        let capacity = self
            .capacity
            .ok_or_else(|| ConfigError::MissingRequired("capacity".into()))?;
        if capacity <= 0.0 {
            return Err(ConfigError::InvalidCapacity(capacity).into());
        }

        let leak_rate = match (self.leak_rate, self.over_time) {
            (Some(_), Some(_)) | (None, None) => return Err(ConfigError::AmbiguousRate.into()),
            (Some(rate), None) => rate,
            (None, Some(over_time)) => {
                let seconds = over_time.as_secs_f64();
                if seconds <= 0.0 {
                    return Err(ConfigError::InvalidLeakRate(0.0).into());
                }
                capacity / seconds
            }
        };
        if leak_rate <= 0.0 {
            return Err(ConfigError::InvalidLeakRate(leak_rate).into());
        }

        let storage = self
            .storage
            .ok_or_else(|| ConfigError::MissingRequired("storage".into()))?;

        let block_for = self
            .block_for
            .unwrap_or_else(|| Duration::from_secs_f64(capacity / leak_rate));
        if block_for.is_zero() {
            return Err(ConfigError::InvalidBlockDuration(block_for).into());
        }

        let storage = Arc::new(storage);
        let bucket = LeakyBucket::new(self.key.clone(), capacity, leak_rate, storage.clone())?;
        let block = Block::new(storage);

        Ok(Throttle {
            key: self.key,
            bucket,
            block,
            block_for,
        })
    }
}
