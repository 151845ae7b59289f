use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AbortFlag;

/// Per-file lifecycle callbacks pushed to the orchestration layer. All
/// methods default to no-ops; implementations must be cheap, they run on the
/// dispatch thread.
pub trait ConstructorObserver: Send + Sync {
    fn on_file_started(&self, _filename: &str) {}

    fn on_file_progress(&self, _filename: &str, _written: u64, _total: u64) {}

    fn on_file_completed(&self, _filename: &str, _success: bool) {}

    /// Fired just before a destructively-replaced prior file is deleted.
    fn before_file_deleted(&self, _filename: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default)]
pub struct NullObserver;

impl ConstructorObserver for NullObserver {}

/// Numeric counters exposed to orchestration, updated atomically as the run
/// proceeds.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    total_required: AtomicU64,
    processed: AtomicU64,
    /// Gauge: bytes still required to finish the install.
    required_to_finish: AtomicU64,
    /// Gauge: bytes currently free on the install volume.
    disk_free: AtomicU64,
    /// Gauge: locked backing-store entries; zero whenever no reads or splats
    /// are in flight, including after an abort drain.
    backing_store_locked: AtomicU64,
}

impl ProgressCounters {
    pub fn total_required_bytes(&self) -> u64 {
        self.total_required.load(Ordering::Relaxed)
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn required_to_finish_bytes(&self) -> u64 {
        self.required_to_finish.load(Ordering::Relaxed)
    }

    pub fn disk_free_bytes(&self) -> u64 {
        self.disk_free.load(Ordering::Relaxed)
    }

    pub fn backing_store_locked_entries(&self) -> u64 {
        self.backing_store_locked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_total_required(&self, bytes: u64) {
        self.total_required.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_processed(&self, bytes: u64) {
        self.processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_required_to_finish(&self, bytes: u64) {
        self.required_to_finish.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_disk_free(&self, bytes: u64) {
        self.disk_free.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_backing_store_locked(&self, entries: u64) {
        self.backing_store_locked.store(entries, Ordering::Relaxed);
    }
}

struct ControlState {
    paused: AtomicBool,
    abort: AbortFlag,
}

/// Cloneable pause/abort handle for one construction run.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<ControlState>,
}

impl ControlHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ControlState { paused: AtomicBool::new(false), abort: AbortFlag::new() }),
        }
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.inner.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Requests abort. Idempotent; returns true only for the first caller.
    pub fn abort(&self) -> bool {
        self.inner.abort.set()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.abort.is_aborted()
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}
