//! Snapshot Registry - Open snapshot bookkeeping and the low watermark
//!
//! The registry tracks:
//! - The set of snapshot ids that are currently open
//! - One pin per open snapshot: the lowest id that snapshot may still need
//!
//! The low watermark is the minimum over pins and open ids. No open snapshot
//! can observe a record whose creation version is below the watermark when a
//! newer record below the watermark dominates it, which makes the watermark
//! the reclamation boundary.
//!
//! All methods take `&mut self`; the runtime's critical section provides the
//! atomicity of open/close. The watermark is mirrored into an atomic so that
//! writers can consult it for slot reuse without entering the critical section.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{SnapshotId, SnapshotIdSet};

/// A pin held by an open snapshot.
///
/// Released exactly once through [`SnapshotRegistry::release_pin`].
#[derive(Debug, PartialEq, Eq)]
pub struct PinHandle {
    pinned: SnapshotId,
}

impl PinHandle {
    /// The pinned id.
    pub fn pinned(&self) -> SnapshotId {
        self.pinned
    }
}

/// Shared read-only view of the current low watermark.
#[derive(Debug, Clone)]
pub struct Watermark {
    value: Arc<AtomicU64>,
}

impl Watermark {
    /// The most recently published watermark.
    ///
    /// The watermark never decreases, so a stale value is always a safe
    /// (conservative) bound for reclamation.
    pub fn get(&self) -> SnapshotId {
        SnapshotId::new(self.value.load(Ordering::Acquire))
    }
}

/// Registry of open snapshots.
#[derive(Debug)]
pub struct SnapshotRegistry {
    /// Ids currently open.
    open: SnapshotIdSet,
    /// Pinned ids with their multiplicity.
    pins: BTreeMap<u64, usize>,
    /// Published low watermark.
    watermark: Arc<AtomicU64>,
}

impl SnapshotRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            open: SnapshotIdSet::empty(),
            pins: BTreeMap::new(),
            watermark: Arc::new(AtomicU64::new(SnapshotId::FIRST.value())),
        }
    }

    /// Handle for lock-free watermark reads.
    pub fn watermark(&self) -> Watermark {
        Watermark {
            value: Arc::clone(&self.watermark),
        }
    }

    /// Register `id` as open.
    pub fn register_open(&mut self, id: SnapshotId) {
        self.open = self.open.set(id);
    }

    /// Remove `id` from the open set and recompute the watermark.
    ///
    /// Returns false if the id was not open.
    pub fn register_closed(&mut self, id: SnapshotId, next: SnapshotId) -> bool {
        let was_open = self.open.get(id);
        self.open = self.open.clear(id);
        self.recompute_watermark(next);
        was_open
    }

    /// Remove every id in `ids` from the open set and recompute the watermark.
    pub fn register_closed_all(&mut self, ids: &SnapshotIdSet, next: SnapshotId) {
        self.open = self.open.and_not(ids);
        self.recompute_watermark(next);
    }

    /// Returns true if `id` is open.
    pub fn is_open(&self, id: SnapshotId) -> bool {
        self.open.get(id)
    }

    /// The current open set.
    pub fn open_ids(&self) -> &SnapshotIdSet {
        &self.open
    }

    /// Number of open ids.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Pin the lowest id a new snapshot may still need.
    ///
    /// A snapshot with id `id` that ignores `invalid` may read records up to
    /// `id`, but it must not lose records older than the lowest id it ignores.
    pub fn pin(&mut self, id: SnapshotId, invalid: &SnapshotIdSet) -> PinHandle {
        let pinned = invalid.lowest(id).min(id);
        *self.pins.entry(pinned.value()).or_insert(0) += 1;
        PinHandle { pinned }
    }

    /// Release a pin and recompute the watermark.
    pub fn release_pin(&mut self, pin: PinHandle, next: SnapshotId) {
        let key = pin.pinned.value();
        if let Some(count) = self.pins.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&key);
            }
        }
        self.recompute_watermark(next);
    }

    /// Number of outstanding pins.
    pub fn pin_count(&self) -> usize {
        self.pins.values().sum()
    }

    /// Compute the low watermark.
    ///
    /// The minimum of the lowest pin, the lowest open id, and `next` (the
    /// clock's next value) when nothing is open.
    pub fn low_watermark(&self, next: SnapshotId) -> SnapshotId {
        let lowest_pin = self
            .pins
            .keys()
            .next()
            .map(|v| SnapshotId::new(*v))
            .unwrap_or(next);
        lowest_pin.min(self.open.lowest(next))
    }

    fn recompute_watermark(&mut self, next: SnapshotId) {
        let low = self.low_watermark(next);
        // Monotonic publication: concurrent readers may only ever see it rise.
        self.watermark.fetch_max(low.value(), Ordering::AcqRel);
    }

    /// Refresh the published watermark after pins were added.
    pub(crate) fn publish_watermark(&mut self, next: SnapshotId) {
        self.recompute_watermark(next);
    }
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
