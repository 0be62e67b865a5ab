//! `Block`: a thin module over the adapter's block registry.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{ConfigError, RateLimitError, Result};
use crate::storage::Storage;

/// Keyed block registry backed by a storage adapter.
#[derive(Debug, Clone)]
pub struct Block<S> {
    storage: S,
}

impl<S: Storage> Block<S> {
    /// Wrap a storage adapter as a block registry.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Install or extend a block. On a non-positive `block_for`, returns
    /// `Ok(None)` instead of propagating the `ConfigError` — a caller
    /// convenience, per spec.
    pub async fn set(&self, key: &str, block_for: Duration) -> Result<Option<DateTime<Utc>>> {
        match self.storage.set_block(key, block_for).await {
            Ok(until) => Ok(Some(until)),
            Err(RateLimitError::Config(ConfigError::InvalidBlockDuration(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The stored `blocked_until` for `key`, iff strictly in the future.
    pub async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.storage.blocked_until(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::storage::memory::{MemoryAdapter, MemoryAdapterConfig};
    use std::sync::Arc;

    fn registry() -> Block<MemoryAdapter> {
        Block::new(MemoryAdapter::with_config(
            MemoryAdapterConfig::default()
                .with_clock(Arc::new(MockClock::default()))
                .manual_gc(),
        ))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let block = registry();
        assert!(block.blocked_until("k").await.unwrap().is_none());

        let until = block.set("k", Duration::from_secs(2)).await.unwrap().unwrap();
        let reported = block.blocked_until("k").await.unwrap().unwrap();
        assert!((reported - until).num_milliseconds().abs() < 50);
    }

    #[tokio::test]
    async fn test_invalid_duration_returns_none_not_err() {
        let block = registry();
        assert_eq!(block.set("k", Duration::ZERO).await.unwrap(), None);
    }
}
