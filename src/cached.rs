//! Cached throttle decorator: short-circuits a throttle while a cached
//! block is known to be in effect, per spec §6's collaborator contract.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::storage::Storage;
use crate::throttle::{RequestError, Throttle, Throttled};

pub use crate::throttle::State;

/// Minimal cache contract a [`CachedThrottle`] needs from its cache store.
pub trait CacheStore: Send + Sync {
    /// Read the cached state for `key`, if present and not yet evicted.
    fn read(&self, key: &str) -> impl Future<Output = Option<State>> + Send;

    /// Cache `state` for `key`, to be considered valid until `expires_after`.
    fn write(&self, key: &str, state: State, expires_after: DateTime<Utc>) -> impl Future<Output = ()> + Send;
}

/// Wraps a [`Throttle`] with a read-through/write-through cache of its
/// blocked state, so repeated requests against an already-blocked key avoid
/// a store round trip.
pub struct CachedThrottle<S, C> {
    throttle: Throttle<S>,
    cache: C,
}

impl<S: Storage, C: CacheStore> CachedThrottle<S, C> {
    /// Wrap a throttle with a cache.
    pub fn new(throttle: Throttle<S>, cache: C) -> Self {
        Self { throttle, cache }
    }

    /// The underlying throttle's key.
    pub fn key(&self) -> &str {
        self.throttle.key()
    }

    /// `false` if a cached block is active; otherwise calls through.
    pub async fn able_to_accept(&self, n: f64) -> Result<bool> {
        if let Some(state) = self.cache.read(self.key()).await {
            if state.blocked() {
                return Ok(false);
            }
        }
        self.throttle.able_to_accept(n).await
    }

    /// Returns the cached state if it is still blocked; otherwise calls
    /// through and caches the result if it came back blocked.
    pub async fn request(&self, n: f64) -> Result<State> {
        if let Some(state) = self.cache.read(self.key()).await {
            if state.blocked() {
                return Ok(state);
            }
        }

        let state = self.throttle.request(n).await?;
        if let Some(until) = state.blocked_until {
            self.cache.write(self.key(), state, until).await;
        }
        Ok(state)
    }

    /// As [`Throttle::request_or_raise`], raising from the cached state
    /// without calling through when a cached block is active.
    pub async fn request_or_raise(&self, n: f64) -> std::result::Result<State, RequestError> {
        if let Some(state) = self.cache.read(self.key()).await {
            if state.blocked() {
                return Err(RequestError::Throttled(Throttled {
                    key: self.key().to_string(),
                    state,
                }));
            }
        }

        match self.throttle.request_or_raise(n).await {
            Err(RequestError::Throttled(t)) => {
                if let Some(until) = t.state.blocked_until {
                    self.cache.write(self.key(), t.state, until).await;
                }
                Err(RequestError::Throttled(t))
            }
            other => other,
        }
    }

    /// Guard via `request(1)`, skipping `body` when the (possibly cached)
    /// state is blocked.
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
