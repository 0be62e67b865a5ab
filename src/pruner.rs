//! Background pruning task.
//!
//! Mirrors the GC-task shape already used by [`crate::storage::memory`]: a
//! `tokio::time::interval` loop, cancelled via a shared `Notify` rather than
//! an abort handle so a dropped `Pruner` shuts its task down cleanly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::storage::Storage;

/// Handle to a spawned periodic pruning task. Dropping it stops the task.
pub struct Pruner {
    shutdown: Arc<Notify>,
}

impl Pruner {
    /// Spawn a task that calls `adapter.prune()` on a fixed interval.
    pub fn spawn_periodic<S: Storage>(adapter: Arc<S>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let task_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match adapter.prune().await {
                            Ok(()) => debug!("prune completed"),
                            Err(e) => warn!(error = %e, "prune failed"),
                        }
                    }
                    _ = task_shutdown.notified() => break,
                }
            }
        });

        Self { shutdown }
    }

    /// Stop the background task. Also happens automatically on drop.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for Pruner {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}
