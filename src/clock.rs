//! Clock abstraction used by the in-process memory adapter.
//!
//! Central stores (Postgres, SQLite, Redis) use the store's own clock for
//! "now" — see each adapter. The memory adapter has no external clock to
//! defer to, so it uses a monotonic [`std::time::Instant`] internally and
//! converts to wall-clock [`chrono::DateTime<Utc>`] only at the boundary,
//! per spec §4.1 and §9.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A monotonic clock, abstracted so tests can control the passage of time
/// without real sleeps.
pub trait Clock: Send + Sync + 'static {
    /// The current monotonic instant.
    fn now(&self) -> Instant;

    /// The current wall-clock time, anchored to the same moment as `now()`.
    fn wall_now(&self) -> DateTime<Utc>;

    /// Convert a monotonic instant observed earlier into a wall-clock time,
    /// by applying the elapsed delta to the current wall-clock reading.
    fn to_wall_clock(&self, instant: Instant) -> DateTime<Utc> {
        let now = self.now();
        let wall_now = self.wall_now();
        if instant >= now {
            wall_now + chrono::Duration::from_std(instant - now).unwrap_or_default()
        } else {
            wall_now - chrono::Duration::from_std(now - instant).unwrap_or_default()
        }
    }
}

/// Production clock: `Instant::now()` paired with `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A mock clock for deterministic tests. Advances only when told to.
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockState>>,
}

#[derive(Debug)]
struct MockClockState {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl MockClock {
    /// Create a mock clock anchored at the given wall-clock time.
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockState {
                instant: Instant::now(),
                wall,
            })),
        }
    }

    /// Advance both the monotonic and wall-clock readings by `delta`.
    pub fn advance(&self, delta: std::time::Duration) {
        let mut state = self.inner.lock();
        state.instant += delta;
        state.wall += chrono::Duration::from_std(delta).unwrap_or_default();
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.inner.lock().instant
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.inner.lock().wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new(DateTime::<Utc>::from_timestamp(1_000, 0).unwrap());
        let t0 = clock.wall_now();

        clock.advance(std::time::Duration::from_secs(5));
        let t1 = clock.wall_now();

        assert_eq!((t1 - t0).num_seconds(), 5);
    }

    #[test]
    fn test_to_wall_clock_past_and_future() {
        let clock = MockClock::new(DateTime::<Utc>::from_timestamp(1_000, 0).unwrap());
        let past = clock.now();

        clock.advance(std::time::Duration::from_secs(10));
        let wall_of_past = clock.to_wall_clock(past);

        assert_eq!((clock.wall_now() - wall_of_past).num_seconds(), 10);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock;
        let t1 = clock.now();
        let t2 = clock.now();
        assert!(t2 >= t1);
    }
}
