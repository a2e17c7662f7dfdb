//! Engine-wide statistics
//!
//! A single [`EngineStats`] instance is shared by every component as explicit
//! context; there are no ambient globals.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters and gauges.
///
/// All fields are updated with relaxed atomics; readers tolerate slightly
/// stale values.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Estimated total memory used by the bucket, in bytes.
    pub mem_used: AtomicU64,
    /// Items awaiting persistence across all vbuckets.
    pub disk_queue_size: AtomicU64,
    /// Items removed by closed-unreferenced checkpoint reclaim.
    pub items_removed_from_checkpoints: AtomicU64,
    /// Items expelled from referenced checkpoints.
    pub items_expelled_from_checkpoints: AtomicU64,
    /// Estimated bytes recovered by expelling.
    pub expelled_bytes: AtomicU64,
    /// Cursors dropped by memory recovery.
    pub cursors_dropped: AtomicU64,
    /// Estimated bytes freed by cursor dropping.
    pub cursor_memory_freed: AtomicU64,
    /// Values ejected by the item pager.
    pub num_value_ejects: AtomicU64,
    /// Expired items removed by the pager.
    pub num_expired_by_pager: AtomicU64,
    /// Sync writes accepted for tracking.
    pub sync_writes_accepted: AtomicU64,
    /// Sync writes committed.
    pub sync_writes_committed: AtomicU64,
    /// Sync writes aborted.
    pub sync_writes_aborted: AtomicU64,
}

impl EngineStats {
    /// Create a zeroed stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account additional memory usage.
    pub fn add_mem_used(&self, bytes: u64) {
        self.mem_used.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Release accounted memory usage.
    pub fn sub_mem_used(&self, bytes: u64) {
        let mut current = self.mem_used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.mem_used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Estimated total memory used, in bytes.
    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Record an item entering the persistence queue.
    pub fn disk_queue_grew(&self) {
        self.disk_queue_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Record items leaving the persistence queue.
    pub fn disk_queue_drained(&self, count: u64) {
        let mut current = self.disk_queue_size.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.disk_queue_size.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current persistence backlog.
    pub fn disk_queue_size(&self) -> u64 {
        self.disk_queue_size.load(Ordering::Relaxed)
    }

    /// Record an expel pass result.
    pub fn record_expel(&self, count: u64, bytes: u64) {
        self.items_expelled_from_checkpoints
            .fetch_add(count, Ordering::Relaxed);
        self.expelled_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a dropped cursor and the memory it unreferenced.
    pub fn record_cursor_dropped(&self, bytes_freed: u64) {
        self.cursors_dropped.fetch_add(1, Ordering::Relaxed);
        self.cursor_memory_freed
            .fetch_add(bytes_freed, Ordering::Relaxed);
    }
}
