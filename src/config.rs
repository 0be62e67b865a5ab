//! Process-wide default adapter registry.
//!
//! Per spec §9: "prefer dependency injection over global state... while
//! still supporting a convenience default." Most constructors here take an
//! explicit adapter; this registry exists only for call sites that don't.
//!
//! `Storage` itself isn't dyn-compatible (its async-fn-in-trait methods
//! return an opaque `impl Future`, which can't sit in a vtable), so the slot
//! holds a [`crate::storage::DynStorage`] — the object-safe erasure of
//! `Storage` — instead of `Arc<dyn Storage>`.

use std::sync::{Arc, OnceLock};

use crate::error::{ConfigError, Result};
use crate::storage::{DynStorage, Storage};

static DEFAULT_ADAPTER: OnceLock<Arc<dyn DynStorage>> = OnceLock::new();

/// Set the process-wide default adapter. Returns `false` if one was already
/// set (the registry is set-once, like the teacher's other process-lifetime
/// globals).
pub fn set_default_adapter<S: Storage>(adapter: S) -> bool {
    DEFAULT_ADAPTER.set(Arc::new(adapter) as Arc<dyn DynStorage>).is_ok()
}

/// Fetch the process-wide default adapter, if one has been configured.
///
/// The returned value itself implements [`Storage`] (via the blanket impl on
/// `Arc<dyn DynStorage>`), so it can be passed straight to
/// `ThrottleBuilder::storage`.
pub fn default_adapter() -> Result<Arc<dyn DynStorage>> {
    DEFAULT_ADAPTER
        .get()
        .cloned()
        .ok_or_else(|| ConfigError::NoDefaultAdapter.into())
}
