//! Record Reclamation
//!
//! A record with creation version `C` is reclaimable iff either:
//! 1. It was abandoned (stamped `SnapshotId::INVALID`), or
//! 2. `C < watermark` and another valid record `D` exists with `C < D < watermark`
//!
//! Rule 2 holds because every open snapshot has an id at or above the
//! watermark and ignores no id below it, so among the records below the
//! watermark each open snapshot reads exactly the newest one.
//!
//! This module provides:
//! - `GcEligibility` - Slot reuse and lifecycle classification
//! - `RecordSweep` - Reclaim every dominated record of one chain
//! - `ReclaimReport` - Aggregate result of a sweep over many cells

use serde::Serialize;

use super::{RecordChain, RecordSlot, SnapshotId, Visibility};

/// Record lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLifecycleState {
    /// Newest record below the watermark, or at/above it.
    /// Some open snapshot may read it.
    Live,

    /// Dominated below the watermark. Its value may be dropped.
    Reclaimable,

    /// Abandoned or already reclaimed. Its slot may be reused.
    Invalid,
}

/// Reclamation eligibility checks.
pub struct GcEligibility;

impl GcEligibility {
    /// Newest valid creation version strictly below `watermark`.
    fn newest_below<V>(chain: &RecordChain<V>, watermark: SnapshotId) -> Option<SnapshotId> {
        chain
            .walk()
            .map(|(_, record)| record.snapshot_id())
            .filter(|id| !id.is_invalid() && *id < watermark)
            .max()
    }

    fn classify(
        candidate: SnapshotId,
        newest: Option<SnapshotId>,
        watermark: SnapshotId,
    ) -> RecordLifecycleState {
        if candidate.is_invalid() {
            return RecordLifecycleState::Invalid;
        }
        match newest {
            Some(dominant) if Visibility::is_dominated(candidate, dominant, watermark) => {
                RecordLifecycleState::Reclaimable
            }
            _ => RecordLifecycleState::Live,
        }
    }

    /// Classify the record at `slot`.
    pub fn lifecycle_state<V>(
        chain: &RecordChain<V>,
        slot: RecordSlot,
        watermark: SnapshotId,
    ) -> RecordLifecycleState {
        let candidate = chain.record(slot).snapshot_id();
        Self::classify(candidate, Self::newest_below(chain, watermark), watermark)
    }

    /// Find a slot the next write may overwrite instead of growing the ring.
    ///
    /// Prefers an invalid slot; otherwise the older of the first two valid
    /// records found below the watermark.
    pub fn reusable_slot<V>(chain: &RecordChain<V>, watermark: SnapshotId) -> Option<RecordSlot> {
        let mut first_below: Option<(RecordSlot, SnapshotId)> = None;
        for (slot, record) in chain.walk() {
            let id = record.snapshot_id();
            if id.is_invalid() {
                return Some(slot);
            }
            if id < watermark {
                match first_below {
                    None => first_below = Some((slot, id)),
                    Some((other_slot, other_id)) => {
                        return Some(if id < other_id { slot } else { other_slot });
                    }
                }
            }
        }
        None
    }
}

/// Outcome of sweeping one chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordSweep {
    /// Records whose values were dropped by this sweep.
    pub reclaimed: usize,
    /// Valid records left in the ring.
    pub retained: usize,
}

impl RecordSweep {
    /// Reclaim every dominated record of `chain` below `watermark`.
    pub fn run<V>(chain: &mut RecordChain<V>, watermark: SnapshotId) -> Self {
        let newest = GcEligibility::newest_below(chain, watermark);
        let mut obscured = Vec::new();
        let mut retained = 0;

        for (slot, record) in chain.walk() {
            match GcEligibility::classify(record.snapshot_id(), newest, watermark) {
                RecordLifecycleState::Reclaimable => obscured.push(slot),
                RecordLifecycleState::Live => retained += 1,
                RecordLifecycleState::Invalid => {}
            }
        }

        for slot in &obscured {
            chain.invalidate(*slot);
        }

        Self {
            reclaimed: obscured.len(),
            retained,
        }
    }

    /// Returns true while more than one record may still be needed, which
    /// keeps the owning cell on the reclamation list.
    pub fn needs_revisit(&self) -> bool {
        self.retained > 1
    }
}

/// Aggregate result of a reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Cells visited by the pass.
    pub cells_scanned: usize,
    /// Records whose values were dropped.
    pub records_reclaimed: usize,
}

impl ReclaimReport {
    /// Fold one sweep into the report.
    pub fn record(&mut self, sweep: RecordSweep) {
        self.cells_scanned += 1;
        self.records_reclaimed += sweep.reclaimed;
    }
}
