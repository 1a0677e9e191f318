//! Metrics registry for the snapshot engine
//!
//! - Counters only (no gauges, no histograms)
//! - Monotonic increase
//! - One registry per runtime
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters for one runtime
///
/// All counters use Relaxed ordering; readers may observe counters from
/// concurrent operations in any interleaving.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Snapshots opened (global advances excluded)
    snapshots_opened: AtomicU64,
    /// Successful applies
    snapshots_applied: AtomicU64,
    /// Disposals of open snapshots
    snapshots_disposed: AtomicU64,
    /// Applies rejected by a conflict
    apply_conflicts: AtomicU64,
    /// Conflicts resolved by a merge policy
    merges: AtomicU64,
    /// Records linked into a ring
    records_allocated: AtomicU64,
    /// Writes that reused a reclaimable slot
    records_reused: AtomicU64,
    /// Records reclaimed by sweeps
    records_reclaimed: AtomicU64,
    /// Change sets handed to apply observers
    notifications_delivered: AtomicU64,
    /// Global snapshot advances
    global_advances: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Snapshot lifecycle

    /// Increment snapshots opened
    pub fn increment_snapshots_opened(&self) {
        self.snapshots_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment snapshots applied
    pub fn increment_snapshots_applied(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment snapshots disposed
    pub fn increment_snapshots_disposed(&self) {
        self.snapshots_disposed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment apply conflicts
    pub fn increment_apply_conflicts(&self) {
        self.apply_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment policy merges
    pub fn increment_merges(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    // Records

    /// Increment records allocated
    pub fn increment_records_allocated(&self) {
        self.records_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment records reused
    pub fn increment_records_reused(&self) {
        self.records_reused.fetch_add(1, Ordering::Relaxed);
    }

    /// Add reclaimed records
    pub fn add_records_reclaimed(&self, count: u64) {
        self.records_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    // Notifications

    /// Increment notifications delivered
    pub fn increment_notifications(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment global advances
    pub fn increment_global_advances(&self) {
        self.global_advances.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values as a JSON object
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            snapshots_opened: self.snapshots_opened.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            snapshots_disposed: self.snapshots_disposed.load(Ordering::Relaxed),
            apply_conflicts: self.apply_conflicts.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            records_allocated: self.records_allocated.load(Ordering::Relaxed),
            records_reused: self.records_reused.load(Ordering::Relaxed),
            records_reclaimed: self.records_reclaimed.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            global_advances: self.global_advances.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub snapshots_opened: u64,
    pub snapshots_applied: u64,
    pub snapshots_disposed: u64,
    pub apply_conflicts: u64,
    pub merges: u64,
    pub records_allocated: u64,
    pub records_reused: u64,
    pub records_reclaimed: u64,
    pub notifications_delivered: u64,
    pub global_advances: u64,
}
