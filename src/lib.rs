//! Leaky-bucket rate limiting with an optional timed-block layer, backed by
//! pluggable storage adapters.
//!
//! A caller identifies a resource by a string key, declares a `capacity`
//! (tokens) and a `leak_rate` (tokens/second, or a drain duration via
//! `over_time`), and asks whether a request of `n` tokens may proceed. Level
//! updates are atomic across concurrent callers sharing the same backing
//! store. When a request overflows the bucket, [`Throttle`] installs a
//! time-bounded block under the same key; while a block is active, every
//! request on that key is refused without consulting the bucket.
//!
//! # Quick start
//!
//! ```ignore
//! use throttlecask::{storage::MemoryAdapter, Throttle};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let throttle = Throttle::builder("user:123")
//!         .capacity(30.0)
//!         .over_time(Duration::from_secs(1))
//!         .storage(MemoryAdapter::new())
//!         .build()
//!         .unwrap();
//!
//!     match throttle.request_or_raise(1.0).await {
//!         Ok(_state) => println!("accepted"),
//!         Err(e) => println!("refused: {e}"),
//!     }
//! }
//! ```
//!
//! # Storage backends
//!
//! | Backend | Feature flag | Atomicity mechanism |
//! |---|---|---|
//! | In-process memory | `memory` (default) | `DashMap` per-key entry lock |
//! | Redis | `redis` | server-side Lua script |
//! | PostgreSQL | `postgres` | single upserting CTE statement |
//! | SQLite | `sqlite` | transaction around a two-statement protocol |
//!
//! # Feature flags
//!
//! - `memory` (default): in-process adapter, no external dependency.
//! - `redis`: Redis-backed adapter via `deadpool_redis`.
//! - `postgres`: PostgreSQL-backed adapter via `tokio-postgres`/`deadpool-postgres`.
//! - `sqlite`: SQLite-backed adapter via `rusqlite`/`r2d2`.
//! - `full`: all of the above.

pub mod block;
pub mod bucket;
pub mod cached;
pub mod clock;
pub mod config;
pub mod error;
pub mod pruner;
pub mod storage;
pub mod throttle;

pub use block::Block;
pub use bucket::LeakyBucket;
pub use cached::{CacheStore, CachedThrottle};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{default_adapter, set_default_adapter};
pub use error::{ConfigError, ConnectionError, RateLimitError, Result, StorageError};
pub use pruner::Pruner;
pub use storage::{BucketState, ConditionalBucketState, DynStorage, Storage};
pub use throttle::{RequestError, State, Throttle, ThrottleBuilder, Throttled};

#[cfg(feature = "memory")]
pub use storage::{GcInterval, MemoryAdapter, MemoryAdapterConfig};

#[cfg(feature = "redis")]
pub use storage::{RedisAdapter, RedisConfig};

#[cfg(feature = "postgres")]
pub use storage::{PostgresAdapter, PostgresConfig};

#[cfg(feature = "sqlite")]
pub use storage::{SqliteAdapter, SqliteConfig};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{RateLimitError, Result};
    pub use crate::storage::Storage;
    pub use crate::throttle::{RequestError, State, Throttle, Throttled};
    pub use crate::{Block, CachedThrottle, LeakyBucket};

    #[cfg(feature = "memory")]
    pub use crate::storage::MemoryAdapter;

    #[cfg(feature = "redis")]
    pub use crate::storage::RedisAdapter;

    #[cfg(feature = "postgres")]
    pub use crate::storage::PostgresAdapter;

    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteAdapter;
}
