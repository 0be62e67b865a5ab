//! In-process memory storage adapter.
//!
//! Uses `DashMap` for thread-safe concurrent access. Atomicity per key comes
//! from holding a single shard entry (`dashmap::mapref::entry::Entry`) for
//! the whole read-modify-write, rather than a separate `key -> Mutex` table —
//! the effect spec §4.1/§9 ask for ("a per-key mutex... acquired, one at a
//! time, in operation scope, with guaranteed release on every exit path") is
//! what `DashMap`'s shard locking already gives us for free.
//!
//! A monotonic clock drives the leak math; wall-clock timestamps are
//! produced only at the boundary, via [`crate::clock::Clock::to_wall_clock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, Result};
use crate::storage::{deletion_horizon, BucketState, ConditionalBucketState, Storage};

/// How often the memory adapter sweeps for expired rows.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Run a sweep every N mutating requests.
    Requests(u64),
    /// Run a sweep on a fixed wall-clock cadence via a background task.
    Duration(Duration),
    /// Never sweep automatically; caller must call `prune()` themselves.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Requests(10_000)
    }
}

/// Configuration for [`MemoryAdapter`].
#[derive(Clone)]
pub struct MemoryAdapterConfig {
    /// When to trigger an automatic sweep.
    pub gc_interval: GcInterval,
    /// Clock used for the leak/block math. Swap in a `MockClock` for tests.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryAdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAdapterConfig")
            .field("gc_interval", &self.gc_interval)
            .finish()
    }
}

impl Default for MemoryAdapterConfig {
    fn default() -> Self {
        Self {
            gc_interval: GcInterval::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl MemoryAdapterConfig {
    /// Use a specific clock (e.g. [`crate::clock::MockClock`] in tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a fixed-cadence background sweep.
    pub fn with_gc_duration(mut self, interval: Duration) -> Self {
        self.gc_interval = GcInterval::Duration(interval);
        self
    }

    /// Disable automatic sweeps.
    pub fn manual_gc(mut self) -> Self {
        self.gc_interval = GcInterval::Manual;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketRow {
    level: f64,
    last_touched: Instant,
    may_be_deleted_after: Instant,
}

/// In-process memory storage adapter.
pub struct MemoryAdapter {
    buckets: DashMap<String, BucketRow>,
    blocks: DashMap<String, Instant>,
    clock: Arc<dyn Clock>,
    gc_interval: GcInterval,
    request_count: AtomicU64,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MemoryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAdapter")
            .field("buckets", &self.buckets.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    /// Create a new memory adapter with default GC configuration and the system clock.
    pub fn new() -> Self {
        Self::with_config(MemoryAdapterConfig::default())
    }

    /// Create a new memory adapter with a custom configuration.
    pub fn with_config(config: MemoryAdapterConfig) -> Self {
        let adapter = Self {
            buckets: DashMap::new(),
            blocks: DashMap::new(),
            clock: config.clock,
            gc_interval: config.gc_interval.clone(),
            request_count: AtomicU64::new(0),
            shutdown: Arc::new(Notify::new()),
        };

        if let GcInterval::Duration(interval) = config.gc_interval {
            adapter.spawn_gc_task(interval);
        }

        adapter
    }

    fn spawn_gc_task(&self, interval: Duration) {
        let buckets = self.buckets.clone();
        let blocks = self.blocks.clone();
        let clock_now = self.clock.now();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now().max(clock_now);
                        sweep(&buckets, &blocks, now);
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    fn maybe_sweep(&self, now: Instant) {
        if let GcInterval::Requests(threshold) = self.gc_interval {
            let count = self.request_count.fetch_add(1, Ordering::Relaxed);
            if threshold > 0 && count % threshold == 0 {
                sweep(&self.buckets, &self.blocks, now);
            }
        }
    }

    /// Number of bucket rows currently tracked (for tests/diagnostics).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of active block rows currently tracked.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl Drop for MemoryAdapter {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

fn sweep(buckets: &DashMap<String, BucketRow>, blocks: &DashMap<String, Instant>, now: Instant) {
    buckets.retain(|_, row| row.may_be_deleted_after >= now);
    blocks.retain(|_, until| *until >= now);
}

fn leaked_level(row: &BucketRow, now: Instant, leak_rate: f64, capacity: f64) -> f64 {
    if now <= row.last_touched {
        return row.level.clamp(0.0, capacity);
    }
    let elapsed = now.duration_since(row.last_touched).as_secs_f64();
    (row.level - elapsed * leak_rate).clamp(0.0, capacity)
}

impl Storage for MemoryAdapter {
    async fn state(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<BucketState> {
        let now = self.clock.now();
        let level = match self.buckets.get(key) {
            Some(row) => leaked_level(&row, now, leak_rate, capacity),
            None => 0.0,
        };
        Ok(BucketState::from_level(level, capacity))
    }

    async fn add_tokens(&self, key: &str, capacity: f64, leak_rate: f64, n: f64) -> Result<BucketState> {
        let now = self.clock.now();
        self.maybe_sweep(now);
        let horizon = deletion_horizon(capacity, leak_rate);

        let post = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let row = occ.get_mut();
                let pre = leaked_level(row, now, leak_rate, capacity);
                let post = (pre + n).clamp(0.0, capacity);
                row.level = post;
                row.last_touched = now;
                row.may_be_deleted_after = now + horizon;
                post
            }
            Entry::Vacant(vac) => {
                let post = n.clamp(0.0, capacity);
                vac.insert(BucketRow {
                    level: post,
                    last_touched: now,
                    may_be_deleted_after: now + horizon,
                });
                post
            }
        };

        Ok(BucketState::from_level(post, capacity))
    }

    async fn add_tokens_conditionally(
        &self,
        key: &str,
        capacity: f64,
        leak_rate: f64,
        n: f64,
    ) -> Result<ConditionalBucketState> {
        let now = self.clock.now();
        self.maybe_sweep(now);
        let horizon = deletion_horizon(capacity, leak_rate);

        let (post, accepted) = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let row = occ.get_mut();
                let pre = leaked_level(row, now, leak_rate, capacity);
                let would = pre + n;
                let accepted = would <= capacity;
                let post = if accepted { would.clamp(0.0, capacity) } else { pre };
                row.level = post;
                row.last_touched = now;
                row.may_be_deleted_after = now + horizon;
                (post, accepted)
            }
            Entry::Vacant(vac) => {
                let pre = 0.0;
                let would = pre + n;
                let accepted = would <= capacity;
                let post = if accepted { would.clamp(0.0, capacity) } else { pre };
                vac.insert(BucketRow {
                    level: post,
                    last_touched: now,
                    may_be_deleted_after: now + horizon,
                });
                (post, accepted)
            }
        };

        Ok(ConditionalBucketState::new(post, capacity, accepted))
    }

    async fn set_block(&self, key: &str, block_for: Duration) -> Result<DateTime<Utc>> {
        if block_for.is_zero() {
            return Err(ConfigError::InvalidBlockDuration(block_for).into());
        }
        let now = self.clock.now();
        let proposed = now + block_for;

        let resulting = match self.blocks.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                let until = occ.get_mut();
                *until = (*until).max(proposed);
                *until
            }
            Entry::Vacant(vac) => {
                vac.insert(proposed);
                proposed
            }
        };

        Ok(self.clock.to_wall_clock(resulting))
    }

    async fn blocked_until(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        match self.blocks.get(key) {
            Some(until) if *until > now => Ok(Some(self.clock.to_wall_clock(*until))),
            _ => Ok(None),
        }
    }

    async fn prune(&self) -> Result<()> {
        sweep(&self.buckets, &self.blocks, self.clock.now());
        Ok(())
    }

    async fn create_tables(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn adapter_with_clock() -> (MemoryAdapter, MockClock) {
        let clock = MockClock::default();
        let adapter = MemoryAdapter::with_config(
            MemoryAdapterConfig::default()
                .with_clock(Arc::new(clock.clone()))
                .manual_gc(),
        );
        (adapter, clock)
    }

    #[tokio::test]
    async fn test_state_on_empty_key() {
        let (adapter, _clock) = adapter_with_clock();
        let state = adapter.state("k", 10.0, 1.0).await.unwrap();
        assert_eq!(state.level, 0.0);
        assert!(!state.at_capacity);
    }

    #[tokio::test]
    async fn test_add_tokens_clamps_to_capacity() {
        let (adapter, _clock) = adapter_with_clock();
        let state = adapter.add_tokens("k", 5.0, 1.0, 100.0).await.unwrap();
        assert_eq!(state.level, 5.0);
        assert!(state.at_capacity);
    }

    #[tokio::test]
    async fn test_add_tokens_negative_clamps_to_zero() {
        let (adapter, _clock) = adapter_with_clock();
        adapter.add_tokens("k", 15.0, 1.1, 10.0).await.unwrap();
        let state = adapter.add_tokens("k", 15.0, 1.1, -100.0).await.unwrap();
        assert_eq!(state.level, 0.0);
    }

    #[tokio::test]
    async fn test_conditional_fillup_stairstep() {
        let (adapter, clock) = adapter_with_clock();

        let r = adapter.add_tokens_conditionally("k", 1.0, 1.0, 1.1).await.unwrap();
        assert!(!r.accepted);
        assert!((r.level - 0.0).abs() < 1e-9);

        let r = adapter.add_tokens_conditionally("k", 1.0, 1.0, 0.3).await.unwrap();
        assert!(r.accepted);
        assert!((r.level - 0.3).abs() < 1e-9);

        let r = adapter.add_tokens_conditionally("k", 1.0, 1.0, 0.3).await.unwrap();
        assert!(r.accepted);
        assert!((r.level - 0.6).abs() < 1e-9);

        let r = adapter.add_tokens_conditionally("k", 1.0, 1.0, 0.3).await.unwrap();
        assert!(r.accepted);
        assert!((r.level - 0.9).abs() < 1e-9);

        let r = adapter.add_tokens_conditionally("k", 1.0, 1.0, 0.3).await.unwrap();
        assert!(!r.accepted);

        clock.advance(Duration::from_millis(200));

        let r = adapter.add_tokens_conditionally("k", 1.0, 1.0, 0.3).await.unwrap();
        assert!(r.accepted);
        assert!((r.level - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_exact_capacity_boundary_accepted() {
        let (adapter, _clock) = adapter_with_clock();
        adapter.add_tokens("k", 10.0, 1.0, 7.0).await.unwrap();
        let r = adapter.add_tokens_conditionally("k", 10.0, 1.0, 3.0).await.unwrap();
        assert!(r.accepted);
        assert_eq!(r.level, 10.0);
    }

    #[tokio::test]
    async fn test_set_block_and_blocked_until() {
        let (adapter, clock) = adapter_with_clock();

        assert!(adapter.blocked_until("k").await.unwrap().is_none());

        let until = adapter.set_block("k", Duration::from_secs_f64(2.2)).await.unwrap();
        let reported = adapter.blocked_until("k").await.unwrap().unwrap();
        assert!((reported - until).num_milliseconds().abs() < 50);

        clock.advance(Duration::from_secs(3));
        assert!(adapter.blocked_until("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_block_invalid_duration() {
        let (adapter, _clock) = adapter_with_clock();
        assert!(adapter.set_block("k", Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_set_block_idempotent_under_max() {
        let (adapter, _clock) = adapter_with_clock();
        let first = adapter.set_block("k", Duration::from_secs(5)).await.unwrap();
        let second = adapter.set_block("k", Duration::from_secs(1)).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_prune_removes_expired_rows() {
        let (adapter, clock) = adapter_with_clock();
        adapter.add_tokens("k", 1.0, 1.0, 1.0).await.unwrap();
        adapter.set_block("b", Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(10));
        adapter.prune().await.unwrap();

        assert_eq!(adapter.bucket_count(), 0);
        assert_eq!(adapter.block_count(), 0);
    }
}
