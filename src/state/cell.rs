//! State cells
//!
//! A `StateCell<V>` is a handle to one observable value. The value is stored
//! as a ring of versioned records guarded by a per-cell `RwLock`; which record
//! a caller sees depends on the snapshot it reads through.
//!
//! Snapshots and the apply engine handle cells of mixed value types through
//! the object-safe `StateObject` seam. Values cross that seam as
//! `StagedValue`s (boxed `Any`), produced and consumed by the same cell.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use super::policy::MergePolicy;
use crate::mvcc::{
    GcEligibility, RecordChain, RecordRef, RecordSweep, SnapshotId, SnapshotIdSet, Visibility,
};
use crate::snapshot::{context, poisoned, SnapshotError, SnapshotResult, SnapshotRuntime};

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique cell identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct CellId(u64);

impl CellId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    fn allocate() -> Self {
        Self(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// How a write landed in the record ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordWrite {
    /// The writer's own record was updated
    InPlace,
    /// A reclaimable slot was restamped
    Reused,
    /// A new slot was linked into the ring
    Allocated,
}

/// The three views an apply reconciles.
pub(crate) struct ApplyView<'a> {
    /// The applying snapshot
    pub snapshot: SnapshotId,
    pub invalid: &'a SnapshotIdSet,
    /// The applying snapshot's view with its own writes hidden
    pub base_invalid: &'a SnapshotIdSet,
    /// The target the snapshot applies into
    pub current: SnapshotId,
    pub current_invalid: &'a SnapshotIdSet,
}

/// A value chosen for publication, still owned by the staging cell.
pub(crate) struct StagedValue {
    value: Box<dyn Any + Send>,
    /// Policy that produced the value, when a conflict was merged
    pub merged_by: Option<&'static str>,
}

/// Type-erased cell operations used by snapshots and the apply engine.
pub(crate) trait StateObject: Send + Sync {
    fn id(&self) -> CellId;

    fn label(&self) -> Option<&str>;

    /// Pick the value to publish, merging when another snapshot published
    /// the cell since `view.snapshot` was taken.
    fn stage_apply(&self, view: &ApplyView<'_>) -> SnapshotResult<StagedValue>;

    /// Publish a staged value as a record stamped `version`.
    fn publish(
        &self,
        version: SnapshotId,
        staged: StagedValue,
        watermark: SnapshotId,
    ) -> SnapshotResult<RecordWrite>;

    /// Write a staged value into `target`'s writable record.
    fn absorb(
        &self,
        target: SnapshotId,
        invalid: &SnapshotIdSet,
        staged: StagedValue,
        watermark: SnapshotId,
    ) -> SnapshotResult<RecordWrite>;

    /// Invalidate every record stamped with one of `ids`.
    fn abandon(&self, ids: &SnapshotIdSet) -> SnapshotResult<usize>;

    /// Reclaim records dominated below `watermark`.
    fn sweep(&self, watermark: SnapshotId) -> SnapshotResult<RecordSweep>;

    /// Records currently holding a value
    fn live_records(&self) -> usize;
}

pub(crate) struct CellInner<V> {
    id: CellId,
    runtime: SnapshotRuntime,
    label: Option<String>,
    policy: Option<MergePolicy<V>>,
    chain: RwLock<RecordChain<V>>,
}

impl<V: Clone + Send + Sync + 'static> CellInner<V> {
    fn staged(&self, staged: StagedValue, snapshot: SnapshotId) -> SnapshotResult<V> {
        staged
            .value
            .downcast::<V>()
            .map(|v| *v)
            .map_err(|_| SnapshotError::RecordCorruption {
                cell: self.id,
                snapshot,
                detail: "staged value has the wrong type".to_string(),
            })
    }

    fn missing_record(&self, chain: &RecordChain<V>, snapshot: SnapshotId) -> SnapshotError {
        let detail = match chain.check_ring() {
            Ok(()) => format!("no valid record among {} slots", chain.len()),
            Err(broken) => format!(
                "ring closed after {} of {} slots",
                broken.steps, broken.len
            ),
        };
        SnapshotError::RecordCorruption {
            cell: self.id,
            snapshot,
            detail,
        }
    }

    fn read_at(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> SnapshotResult<V> {
        let chain = self.chain.read().map_err(poisoned("cell records"))?;
        Visibility::readable(&*chain, id, invalid)
            .and_then(|(_, record)| record.value().cloned())
            .ok_or_else(|| self.missing_record(&chain, id))
    }

    fn write_at(
        &self,
        id: SnapshotId,
        invalid: &SnapshotIdSet,
        value: V,
        watermark: SnapshotId,
    ) -> SnapshotResult<RecordWrite> {
        let mut chain = self.chain.write().map_err(poisoned("cell records"))?;
        let own = Visibility::readable(&*chain, id, invalid)
            .filter(|(_, record)| record.snapshot_id() == id)
            .map(|(slot, _)| slot);
        if let Some(slot) = own {
            chain.set_value(slot, value);
            return Ok(RecordWrite::InPlace);
        }
        Ok(Self::place(&mut *chain, value, id, watermark))
    }

    fn place(
        chain: &mut RecordChain<V>,
        value: V,
        stamp: SnapshotId,
        watermark: SnapshotId,
    ) -> RecordWrite {
        match GcEligibility::reusable_slot(chain, watermark) {
            Some(slot) => {
                chain.overwrite(slot, value, stamp);
                RecordWrite::Reused
            }
            None => {
                chain.link(value, stamp);
                RecordWrite::Allocated
            }
        }
    }
}

impl<V: Clone + Send + Sync + 'static> StateObject for CellInner<V> {
    fn id(&self) -> CellId {
        self.id
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn stage_apply(&self, view: &ApplyView<'_>) -> SnapshotResult<StagedValue> {
        let chain = self.chain.read().map_err(poisoned("cell records"))?;
        let (current_slot, current) = Visibility::readable(&*chain, view.current, view.current_invalid)
            .ok_or_else(|| self.missing_record(&chain, view.current))?;
        let (previous_slot, previous) = Visibility::readable(&*chain, view.snapshot, view.base_invalid)
            .ok_or_else(|| self.missing_record(&chain, view.snapshot))?;
        let (_, applied) = Visibility::readable(&*chain, view.snapshot, view.invalid)
            .ok_or_else(|| self.missing_record(&chain, view.snapshot))?;

        let applied_value = applied
            .value()
            .ok_or_else(|| self.missing_record(&chain, view.snapshot))?;

        let current_ref: RecordRef = chain.record_ref(current_slot);
        if current_ref == chain.record_ref(previous_slot) {
            return Ok(StagedValue {
                value: Box::new(applied_value.clone()),
                merged_by: None,
            });
        }

        let conflict = || SnapshotError::ApplyConflict {
            snapshot: view.snapshot,
            cell: self.id,
            label: self.label.clone(),
        };
        let policy = self.policy.as_ref().ok_or_else(conflict)?;
        let (Some(previous_value), Some(current_value)) = (previous.value(), current.value()) else {
            return Err(self.missing_record(&chain, view.snapshot));
        };
        let merged = policy
            .merge(previous_value, applied_value, current_value)
            .ok_or_else(conflict)?;
        Ok(StagedValue {
            value: Box::new(merged),
            merged_by: Some(policy.name()),
        })
    }

    fn publish(
        &self,
        version: SnapshotId,
        staged: StagedValue,
        watermark: SnapshotId,
    ) -> SnapshotResult<RecordWrite> {
        let value = self.staged(staged, version)?;
        let mut chain = self.chain.write().map_err(poisoned("cell records"))?;
        Ok(Self::place(&mut *chain, value, version, watermark))
    }

    fn absorb(
        &self,
        target: SnapshotId,
        invalid: &SnapshotIdSet,
        staged: StagedValue,
        watermark: SnapshotId,
    ) -> SnapshotResult<RecordWrite> {
        let value = self.staged(staged, target)?;
        self.write_at(target, invalid, value, watermark)
    }

    fn abandon(&self, ids: &SnapshotIdSet) -> SnapshotResult<usize> {
        let mut chain = self.chain.write().map_err(poisoned("cell records"))?;
        let slots: Vec<_> = chain
            .walk()
            .filter(|(_, record)| ids.get(record.snapshot_id()))
            .map(|(slot, _)| slot)
            .collect();
        for slot in &slots {
            chain.invalidate(*slot);
        }
        Ok(slots.len())
    }

    fn sweep(&self, watermark: SnapshotId) -> SnapshotResult<RecordSweep> {
        let mut chain = self.chain.write().map_err(poisoned("cell records"))?;
        Ok(RecordSweep::run(&mut *chain, watermark))
    }

    fn live_records(&self) -> usize {
        let chain = self.chain.read().unwrap_or_else(PoisonError::into_inner);
        chain.walk().filter(|(_, record)| !record.is_invalid()).count()
    }
}

/// Handle to one observable value.
///
/// Cloning the handle shares the cell. Reads and writes go through the
/// snapshot entered on the current thread, or the runtime's global snapshot
/// when none is entered.
pub struct StateCell<V> {
    inner: Arc<CellInner<V>>,
}

impl<V> Clone for StateCell<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> StateCell<V> {
    pub(crate) fn new(
        runtime: SnapshotRuntime,
        initial: V,
        label: Option<String>,
        policy: Option<MergePolicy<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: CellId::allocate(),
                runtime,
                label,
                policy,
                chain: RwLock::new(RecordChain::new(initial, SnapshotId::PREEXISTING)),
            }),
        }
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Name of the merge policy, if the cell has one
    pub fn policy_name(&self) -> Option<&'static str> {
        self.inner.policy.as_ref().map(|p| p.name())
    }

    pub fn runtime(&self) -> &SnapshotRuntime {
        &self.inner.runtime
    }

    /// Read through the current snapshot.
    pub fn get(&self) -> SnapshotResult<V> {
        match context::current_for(self.inner.runtime.id()) {
            Some(snapshot) => snapshot.read(self),
            None => self.inner.runtime.read_global(self),
        }
    }

    /// Write through the current snapshot.
    pub fn set(&self, value: V) -> SnapshotResult<()> {
        match context::current_for(self.inner.runtime.id()) {
            Some(snapshot) => snapshot.write(self, value),
            None => self.inner.runtime.write_global(self, value),
        }
    }

    /// Read, transform and write back through the current snapshot.
    pub fn update<F>(&self, f: F) -> SnapshotResult<()>
    where
        F: FnOnce(&V) -> V,
    {
        let value = self.get()?;
        self.set(f(&value))
    }

    /// Slots in the record ring, reclaimed ones included
    pub fn record_count(&self) -> usize {
        self.inner
            .chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Records holding a value
    pub fn live_record_count(&self) -> usize {
        self.inner.live_records()
    }

    pub(crate) fn read_at(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> SnapshotResult<V> {
        self.inner.read_at(id, invalid)
    }

    pub(crate) fn write_at(
        &self,
        id: SnapshotId,
        invalid: &SnapshotIdSet,
        value: V,
        watermark: SnapshotId,
    ) -> SnapshotResult<RecordWrite> {
        self.inner.write_at(id, invalid, value, watermark)
    }

    pub(crate) fn object(&self) -> Arc<dyn StateObject> {
        self.inner.clone()
    }
}

impl<V> fmt::Debug for StateCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::policy;

    fn id(v: u64) -> SnapshotId {
        SnapshotId::new(v)
    }

    fn set(ids: &[u64]) -> SnapshotIdSet {
        ids.iter().map(|v| id(*v)).collect()
    }

    fn cell<V: Clone + Send + Sync + 'static>(
        initial: V,
        policy: Option<MergePolicy<V>>,
    ) -> StateCell<V> {
        StateCell::new(SnapshotRuntime::new(), initial, Some("test".into()), policy)
    }

    fn staged_value<V: Clone + 'static>(staged: StagedValue) -> V {
        staged.value.downcast_ref::<V>().cloned().unwrap()
    }

    #[test]
    fn test_cell_ids_are_unique() {
        let a = cell(0, None);
        let b = cell(0, None);
        assert_ne!(a.id(), b.id());
        assert_eq!(CellId::new(3).to_string(), "cell#3");
    }

    #[test]
    fn test_initial_record_visible_to_every_snapshot() {
        let c = cell("init", None);
        assert_eq!(c.read_at(id(2), &SnapshotIdSet::empty()).unwrap(), "init");
        assert_eq!(c.read_at(id(500), &set(&[2, 3])).unwrap(), "init");
    }

    #[test]
    fn test_second_write_is_in_place() {
        let c = cell(0, None);
        let none = SnapshotIdSet::empty();
        assert_eq!(c.write_at(id(5), &none, 1, id(2)).unwrap(), RecordWrite::Allocated);
        assert_eq!(c.write_at(id(5), &none, 2, id(2)).unwrap(), RecordWrite::InPlace);
        assert_eq!(c.record_count(), 2);
        assert_eq!(c.read_at(id(5), &none).unwrap(), 2);
        assert_eq!(c.read_at(id(4), &none).unwrap(), 0);
    }

    #[test]
    fn test_write_reuses_dominated_slot() {
        let c = cell(0, None);
        let none = SnapshotIdSet::empty();
        c.write_at(id(3), &none, 1, id(2)).unwrap();
        // Records 1 and 3 are both below watermark 6; the older is reusable.
        assert_eq!(c.write_at(id(7), &none, 2, id(6)).unwrap(), RecordWrite::Reused);
        assert_eq!(c.record_count(), 2);
        assert_eq!(c.read_at(id(6), &none).unwrap(), 1);
        assert_eq!(c.read_at(id(7), &none).unwrap(), 2);
    }

    #[test]
    fn test_clean_apply_stages_written_value() {
        let c = cell(10, None);
        let none = SnapshotIdSet::empty();
        c.write_at(id(4), &none, 11, id(2)).unwrap();

        let base_invalid = set(&[4]);
        let current_invalid = set(&[4]);
        let view = ApplyView {
            snapshot: id(4),
            invalid: &none,
            base_invalid: &base_invalid,
            current: id(9),
            current_invalid: &current_invalid,
        };
        let staged = c.inner.stage_apply(&view).unwrap();
        assert!(staged.merged_by.is_none());
        assert_eq!(staged_value::<i32>(staged), 11);
    }

    #[test]
    fn test_concurrent_publish_without_policy_conflicts() {
        let c = cell(0, None);
        let none = SnapshotIdSet::empty();
        c.write_at(id(4), &none, 1, id(2)).unwrap();
        c.write_at(id(5), &none, 2, id(2)).unwrap();
        // Snapshot 5 published as version 6 while snapshot 4 was open.
        c.inner.publish(id(6), StagedValue { value: Box::new(2), merged_by: None }, id(2)).unwrap();

        let invalid = set(&[5]);
        let base_invalid = set(&[4, 5]);
        let current_invalid = set(&[4, 5]);
        let view = ApplyView {
            snapshot: id(4),
            invalid: &invalid,
            base_invalid: &base_invalid,
            current: id(7),
            current_invalid: &current_invalid,
        };
        let err = c.inner.stage_apply(&view).err().unwrap();
        assert_eq!(err.conflicting_cell(), Some(c.id()));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_concurrent_publish_with_policy_merges() {
        let c = cell(0i64, Some(policy::add_deltas()));
        let none = SnapshotIdSet::empty();
        c.write_at(id(4), &none, 2, id(2)).unwrap();
        c.write_at(id(5), &none, 1, id(2)).unwrap();
        c.inner.publish(id(6), StagedValue { value: Box::new(1i64), merged_by: None }, id(2)).unwrap();

        let invalid = set(&[5]);
        let base_invalid = set(&[4, 5]);
        let current_invalid = set(&[4, 5]);
        let view = ApplyView {
            snapshot: id(4),
            invalid: &invalid,
            base_invalid: &base_invalid,
            current: id(7),
            current_invalid: &current_invalid,
        };
        let staged = c.inner.stage_apply(&view).unwrap();
        assert_eq!(staged.merged_by, Some("add_deltas"));
        assert_eq!(staged_value::<i64>(staged), 3);
    }

    #[test]
    fn test_abandon_hides_records() {
        let c = cell(0, None);
        let none = SnapshotIdSet::empty();
        c.write_at(id(4), &none, 9, id(2)).unwrap();
        assert_eq!(c.inner.abandon(&set(&[4])).unwrap(), 1);
        assert_eq!(c.read_at(id(10), &none).unwrap(), 0);
        assert_eq!(c.live_record_count(), 1);
    }

    #[test]
    fn test_wrong_staged_type_is_corruption() {
        let c = cell(0u8, None);
        let err = c
            .inner
            .publish(id(6), StagedValue { value: Box::new("x"), merged_by: None }, id(2))
            .err()
            .unwrap();
        assert!(matches!(err, SnapshotError::RecordCorruption { .. }));
    }
}
