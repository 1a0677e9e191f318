//! Record Visibility - Deterministic snapshot isolation over record rings
//!
//! ## Visibility Rule
//!
//! Given a snapshot with id `S` and invalid set `I`, a record with creation
//! version `C` is valid iff:
//! 1. `C` is not `SnapshotId::INVALID`
//! 2. `C <= S`
//! 3. `C` is not a member of `I`
//!
//! The readable record is the valid record with the **largest** `C`.
//!
//! A nested snapshot inherits its parent's invalid set and is numbered after
//! the parent, so it sees everything the parent could see plus its own writes.
//! No ancestor walk is needed at read time.
//!
//! ## Guarantees
//!
//! - Identical inputs always select the same record
//! - A higher `S` with an equal or smaller `I` never sees an older record
//! - Abandoned and reclaimed records are never selected

use super::{RecordChain, RecordSlot, SnapshotId, SnapshotIdSet, StateRecord};

/// Stateless visibility resolver.
pub struct Visibility;

impl Visibility {
    /// Returns true if a record created at `candidate` is valid for snapshot
    /// `id` ignoring `invalid`.
    #[inline]
    pub fn is_valid(candidate: SnapshotId, id: SnapshotId, invalid: &SnapshotIdSet) -> bool {
        !candidate.is_invalid() && candidate <= id && !invalid.get(candidate)
    }

    /// Select the readable record of `chain` for snapshot `id`.
    ///
    /// Returns `None` when no record is valid, which for a live cell means the
    /// ring is corrupt.
    pub fn readable<'a, V>(
        chain: &'a RecordChain<V>,
        id: SnapshotId,
        invalid: &SnapshotIdSet,
    ) -> Option<(RecordSlot, &'a StateRecord<V>)> {
        chain
            .walk()
            .filter(|(_, record)| Self::is_valid(record.snapshot_id(), id, invalid))
            .max_by_key(|(_, record)| record.snapshot_id())
    }

    /// Returns true if the record `candidate` is obscured for every snapshot
    /// at or above `watermark` by a newer valid record `dominant`.
    ///
    /// Both must be below the watermark: a snapshot with id >= watermark and
    /// no invalid ids below the watermark would choose `dominant`.
    #[inline]
    pub fn is_dominated(candidate: SnapshotId, dominant: SnapshotId, watermark: SnapshotId) -> bool {
        !candidate.is_invalid() && candidate < dominant && dominant < watermark
    }
}
