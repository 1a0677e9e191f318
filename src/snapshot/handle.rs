//! Snapshot handles
//!
//! A `Snapshot` is a cheap, clonable handle. The snapshot's id, invalid set
//! and written cells live in a core guarded by a per-snapshot mutex.
//! Dropping the last handle of an open snapshot disposes it.
//!
//! A snapshot with open children keeps its records and ids until the last
//! child closes, even once disposed: children read through their parent's
//! records.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::apply;
use super::context::{self, Frame};
use super::errors::{poisoned, SnapshotError, SnapshotResult};
use super::lifecycle::{SnapshotKind, SnapshotState};
use super::runtime::{RuntimeState, SnapshotRuntime};
use crate::mvcc::{PinHandle, SnapshotId, SnapshotIdSet};
use crate::observability::{log_event, Event};
use crate::observer::SnapshotObservers;
use crate::state::{CellId, StateCell, StateObject};

pub(crate) struct SnapshotCore {
    pub id: SnapshotId,
    pub invalid: SnapshotIdSet,
    /// Ids this snapshot retired when opening children, and ids taken over
    /// from applied children
    pub previous_ids: SnapshotIdSet,
    /// False for a read-only child sharing its parent's id
    pub owns_id: bool,
    pub state: SnapshotState,
    pub pin: Option<PinHandle>,
    pub modified: BTreeMap<CellId, Arc<dyn StateObject>>,
    /// Children opened from this snapshot that have not settled
    pub active_children: usize,
    /// Disposed while children were open; records and ids are released
    /// when the last child settles
    pub release_pending: bool,
    /// Terminal with no open children; the parent no longer counts it
    pub settled: bool,
}

impl SnapshotCore {
    pub fn new(id: SnapshotId, invalid: SnapshotIdSet, owns_id: bool, pin: PinHandle) -> Self {
        Self {
            id,
            invalid,
            previous_ids: SnapshotIdSet::empty(),
            owns_id,
            state: SnapshotState::Open,
            pin: Some(pin),
            modified: BTreeMap::new(),
            active_children: 0,
            release_pending: false,
            settled: false,
        }
    }

    /// Every id whose records belong to this snapshot.
    pub fn own_ids(&self) -> SnapshotIdSet {
        if self.owns_id {
            self.previous_ids.set(self.id)
        } else {
            self.previous_ids.clone()
        }
    }

    pub fn ensure_open(&self, operation: &'static str) -> SnapshotResult<()> {
        if self.state.is_terminal() {
            return Err(SnapshotError::illegal_state(self.id, self.state, operation));
        }
        Ok(())
    }
}

pub(crate) struct SnapshotInner {
    pub runtime: SnapshotRuntime,
    pub kind: SnapshotKind,
    pub parent: Option<Snapshot>,
    /// Own observers merged with every ancestor's
    pub observers: SnapshotObservers,
    pub core: Mutex<SnapshotCore>,
}

impl SnapshotInner {
    pub fn lock_core(&self) -> SnapshotResult<MutexGuard<'_, SnapshotCore>> {
        self.core.lock().map_err(poisoned("snapshot core"))
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        let open = self
            .core
            .get_mut()
            .map(|core| core.state == SnapshotState::Open)
            .unwrap_or(false);
        if open {
            let _ = dispose(self);
        }
    }
}

/// A versioned, isolated view of every cell in one runtime.
#[derive(Clone)]
pub struct Snapshot {
    pub(crate) inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub(crate) fn new(
        runtime: SnapshotRuntime,
        kind: SnapshotKind,
        parent: Option<Snapshot>,
        observers: SnapshotObservers,
        core: SnapshotCore,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                runtime,
                kind,
                parent,
                observers,
                core: Mutex::new(core),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, SnapshotCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current id. A mutable snapshot moves to a fresh id whenever it opens
    /// a child.
    pub fn id(&self) -> SnapshotId {
        self.core().id
    }

    pub fn kind(&self) -> SnapshotKind {
        self.inner.kind
    }

    pub fn state(&self) -> SnapshotState {
        self.core().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SnapshotState::Open
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.kind.is_read_only()
    }

    pub fn parent(&self) -> Option<&Snapshot> {
        self.inner.parent.as_ref()
    }

    pub fn runtime(&self) -> &SnapshotRuntime {
        &self.inner.runtime
    }

    /// Ids whose writes this snapshot ignores
    pub fn invalid_ids(&self) -> SnapshotIdSet {
        self.core().invalid.clone()
    }

    /// True once a mutable snapshot has written at least one cell
    pub fn has_pending_changes(&self) -> bool {
        !self.core().modified.is_empty()
    }

    /// Cells written so far, ascending
    pub fn modified_cells(&self) -> Vec<CellId> {
        self.core().modified.keys().copied().collect()
    }

    /// Nested snapshots opened from this one that are still open
    pub fn open_children(&self) -> usize {
        self.core().active_children
    }

    // ==================
    // Reads and writes
    // ==================

    /// Read `cell` as this snapshot sees it.
    pub fn read<V>(&self, cell: &StateCell<V>) -> SnapshotResult<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.inner.lock_core()?.ensure_open("read")?;

        let runtime = &self.inner.runtime;
        if runtime.shared.observation_enabled() {
            context::notify_read(runtime.id(), cell.id());
        }
        self.inner.observers.notify_read(cell.id());

        let core = self.inner.lock_core()?;
        core.ensure_open("read")?;
        cell.read_at(core.id, &core.invalid).inspect_err(|e| {
            if let SnapshotError::RecordCorruption { detail, .. } = e {
                log_event(
                    Event::RecordCorruption,
                    &[
                        ("cell", &cell.id().to_string()),
                        ("snapshot", &core.id.to_string()),
                        ("detail", detail),
                    ],
                );
            }
        })
    }

    /// Write `value` to `cell` inside this snapshot.
    ///
    /// The snapshot's write observer runs after the first write of each
    /// cell, with no lock held.
    pub fn write<V>(&self, cell: &StateCell<V>, value: V) -> SnapshotResult<()>
    where
        V: Clone + Send + Sync + 'static,
    {
        let first_write = {
            let mut core = self.inner.lock_core()?;
            core.ensure_open("write")?;
            if self.inner.kind.is_read_only() {
                return Err(SnapshotError::IllegalWrite { snapshot: core.id });
            }

            let shared = &self.inner.runtime.shared;
            let outcome = cell.write_at(core.id, &core.invalid, value, shared.watermark.get())?;
            shared.record_write(outcome);
            match core.modified.entry(cell.id()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(cell.object());
                    true
                }
            }
        };
        if first_write {
            self.inner.observers.notify_write(cell.id());
        }
        Ok(())
    }

    /// Run `block` with this snapshot current on this thread.
    pub fn enter<R, F: FnOnce() -> R>(&self, block: F) -> R {
        context::with_frame(Frame::Snapshot(self.clone()), block)
    }

    // ==================
    // Nesting
    // ==================

    /// Open a read-only child that sees what this snapshot sees now.
    pub fn take_nested_snapshot(&self) -> SnapshotResult<Snapshot> {
        self.open_child(SnapshotKind::NestedReadOnly, SnapshotObservers::new())
    }

    /// Open a read-only child with its own observers. Only read observers
    /// ever run on a read-only snapshot.
    pub fn take_nested_snapshot_with_observers(
        &self,
        observers: SnapshotObservers,
    ) -> SnapshotResult<Snapshot> {
        self.open_child(SnapshotKind::NestedReadOnly, observers)
    }

    /// Open a mutable child whose writes reach this snapshot only when the
    /// child applies.
    pub fn take_nested_mutable_snapshot(&self) -> SnapshotResult<Snapshot> {
        self.take_nested_mutable_snapshot_with_observers(SnapshotObservers::new())
    }

    /// Open a mutable child with its own observers, called before this
    /// snapshot's.
    pub fn take_nested_mutable_snapshot_with_observers(
        &self,
        observers: SnapshotObservers,
    ) -> SnapshotResult<Snapshot> {
        if self.inner.kind.is_read_only() {
            let core = self.inner.lock_core()?;
            core.ensure_open("take nested mutable snapshot of")?;
            return Err(SnapshotError::IllegalWrite { snapshot: core.id });
        }
        self.open_child(SnapshotKind::NestedMutable, observers)
    }

    fn open_child(
        &self,
        kind: SnapshotKind,
        observers: SnapshotObservers,
    ) -> SnapshotResult<Snapshot> {
        let runtime = &self.inner.runtime;
        let core = {
            let mut state = runtime.shared.lock_state()?;
            let mut parent = self.inner.lock_core()?;
            parent.ensure_open("take nested snapshot of")?;

            let core = if self.inner.kind.is_read_only() {
                runtime.check_open_limit(&state, 1)?;
                // Nothing can change under a read-only parent: share its view.
                let pin = state.registry.pin(parent.id, &parent.invalid);
                SnapshotCore::new(parent.id, parent.invalid.clone(), false, pin)
            } else {
                // The child's id and the parent's fresh id.
                runtime.check_open_limit(&state, 2)?;
                open_mutable_child(&mut state, &mut parent)
            };
            parent.active_children += 1;

            runtime.shared.metrics.increment_snapshots_opened();
            log_event(
                Event::SnapshotOpen,
                &[
                    ("kind", kind.as_str()),
                    ("parent", &parent.id.to_string()),
                    ("snapshot", &core.id.to_string()),
                ],
            );
            core
        };
        let observers = observers.merged(&self.inner.observers);
        Ok(Snapshot::new(runtime.clone(), kind, Some(self.clone()), observers, core))
    }

    // ==================
    // Lifecycle
    // ==================

    /// Commit this snapshot's writes.
    ///
    /// A root snapshot publishes into global state and notifies apply
    /// observers before returning. A nested snapshot publishes into its
    /// parent. On `ApplyConflict` the snapshot stays open.
    pub fn apply(&self) -> SnapshotResult<()> {
        match &self.inner.parent {
            Some(parent) => apply::apply_nested(&self.inner, parent),
            None => apply::apply_root(&self.inner),
        }
    }

    /// Close the snapshot, discarding unapplied writes.
    pub fn dispose(&self) -> SnapshotResult<()> {
        dispose(&self.inner)
    }
}

/// Register a child id after the parent's and move the parent to a fresh id,
/// so parent and child stop seeing each other's subsequent writes.
fn open_mutable_child(state: &mut RuntimeState, parent: &mut SnapshotCore) -> SnapshotCore {
    let child_id = state.clock.next_version();
    let child_invalid = parent.invalid.add_range(parent.id.successor(), child_id);
    state.registry.register_open(child_id);
    let pin = state.registry.pin(child_id, &child_invalid);

    let parent_id = state.clock.next_version();
    state.registry.register_open(parent_id);
    parent.previous_ids = parent.previous_ids.set(parent.id);
    parent.invalid = parent.invalid.add_range(parent.id.successor(), parent_id);
    parent.id = parent_id;

    SnapshotCore::new(child_id, child_invalid, true, pin)
}

/// Abandon the records of a disposed snapshot and close its ids.
/// Returns the number of records abandoned.
fn release_records(
    state: &mut RuntimeState,
    kind: SnapshotKind,
    core: &mut SnapshotCore,
) -> SnapshotResult<usize> {
    let own = core.own_ids();
    let mut abandoned = 0;
    if !kind.is_read_only() {
        for object in core.modified.values() {
            abandoned += object.abandon(&own)?;
        }
    }
    state.close_ids(&own);
    core.modified.clear();
    core.release_pending = false;
    Ok(abandoned)
}

/// Settle a terminal snapshot once its last child has settled, finishing a
/// deferred release. Returns true when the parent should stop counting it.
pub(crate) fn settle(
    state: &mut RuntimeState,
    kind: SnapshotKind,
    core: &mut SnapshotCore,
) -> SnapshotResult<bool> {
    if core.settled || !core.state.is_terminal() || core.active_children > 0 {
        return Ok(false);
    }
    if core.release_pending {
        let abandoned = release_records(state, kind, core)?;
        log_event(
            Event::SnapshotDispose,
            &[
                ("kind", kind.as_str()),
                ("records_abandoned", &abandoned.to_string()),
                ("snapshot", &core.id.to_string()),
            ],
        );
    }
    core.settled = true;
    Ok(true)
}

/// A child of `parent` settled. Settling may cascade up the chain.
fn child_settled(state: &mut RuntimeState, parent: &Snapshot) -> SnapshotResult<()> {
    let mut current = Some(parent);
    while let Some(snapshot) = current {
        let settled = {
            let mut core = snapshot.inner.lock_core()?;
            core.active_children = core.active_children.saturating_sub(1);
            settle(state, snapshot.inner.kind, &mut core)?
        };
        current = if settled { snapshot.inner.parent.as_ref() } else { None };
    }
    Ok(())
}

pub(crate) fn dispose(inner: &SnapshotInner) -> SnapshotResult<()> {
    let shared = &inner.runtime.shared;
    let mut state = shared.lock_state()?;

    let settled = {
        let mut core = inner.lock_core()?;
        match core.state {
            SnapshotState::Disposed => {
                return Err(SnapshotError::illegal_state(
                    core.id,
                    core.state,
                    "dispose",
                ))
            }
            SnapshotState::Applied => {
                core.state = SnapshotState::Disposed;
                return Ok(());
            }
            SnapshotState::Open => {}
        }

        state.release_pin(core.pin.take());
        core.state = SnapshotState::Disposed;
        core.release_pending = true;
        shared.metrics.increment_snapshots_disposed();
        if core.active_children > 0 {
            log_event(
                Event::SnapshotDispose,
                &[
                    ("kind", inner.kind.as_str()),
                    ("open_children", &core.active_children.to_string()),
                    ("snapshot", &core.id.to_string()),
                ],
            );
        }
        settle(&mut state, inner.kind, &mut core)?
    };

    match (&inner.parent, settled) {
        (Some(parent), true) => child_settled(&mut state, parent),
        _ => Ok(()),
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Snapshot")
            .field("id", &core.id)
            .field("kind", &self.inner.kind)
            .field("state", &core.state)
            .field("modified", &core.modified.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_between_mutable_snapshots() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let s1 = runtime.take_mutable_snapshot().unwrap();
        let s2 = runtime.take_mutable_snapshot().unwrap();

        s1.write(&cell, 1).unwrap();
        s2.write(&cell, 2).unwrap();

        assert_eq!(s1.read(&cell).unwrap(), 1);
        assert_eq!(s2.read(&cell).unwrap(), 2);
        assert_eq!(cell.get().unwrap(), 0);
    }

    #[test]
    fn test_write_through_read_only_is_illegal() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let snapshot = runtime.take_snapshot().unwrap();

        let err = snapshot.write(&cell, 1).unwrap_err();
        assert!(matches!(err, SnapshotError::IllegalWrite { .. }));
    }

    #[test]
    fn test_use_after_dispose_is_illegal_state() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let snapshot = runtime.take_mutable_snapshot().unwrap();
        snapshot.dispose().unwrap();

        for err in [
            snapshot.read(&cell).unwrap_err(),
            snapshot.write(&cell, 1).unwrap_err(),
            snapshot.dispose().unwrap_err(),
        ] {
            assert_eq!(err.code(), "AERO_SNAPSHOT_ILLEGAL_STATE");
        }
    }

    #[test]
    fn test_dispose_discards_writes_and_closes_id() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let snapshot = runtime.take_mutable_snapshot().unwrap();
        snapshot.write(&cell, 5).unwrap();
        assert_eq!(runtime.open_snapshot_count().unwrap(), 2);

        snapshot.dispose().unwrap();
        assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
        assert_eq!(cell.live_record_count(), 1);
        assert_eq!(runtime.take_snapshot().unwrap().read(&cell).unwrap(), 0);
    }

    #[test]
    fn test_dropping_last_handle_disposes() {
        let runtime = SnapshotRuntime::new();
        {
            let snapshot = runtime.take_snapshot().unwrap();
            let _copy = snapshot.clone();
            assert_eq!(runtime.open_snapshot_count().unwrap(), 2);
        }
        assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
        assert_eq!(runtime.metrics().snapshots_disposed, 1);
    }

    #[test]
    fn test_modified_cells() {
        let runtime = SnapshotRuntime::new();
        let a = runtime.create_cell(0);
        let b = runtime.create_cell(0);
        let snapshot = runtime.take_mutable_snapshot().unwrap();
        assert!(!snapshot.has_pending_changes());

        snapshot.write(&b, 1).unwrap();
        snapshot.write(&a, 1).unwrap();
        snapshot.write(&b, 2).unwrap();

        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(snapshot.modified_cells(), expected);
        assert!(snapshot.has_pending_changes());
    }

    #[test]
    fn test_enter_routes_cell_access() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(String::from("before"));
        let snapshot = runtime.take_mutable_snapshot().unwrap();

        snapshot.enter(|| cell.set("inside".to_string())).unwrap();
        assert_eq!(cell.get().unwrap(), "before");
        assert_eq!(snapshot.enter(|| cell.get()).unwrap(), "inside");
    }

    #[test]
    fn test_mutable_parent_moves_to_fresh_id() {
        let runtime = SnapshotRuntime::new();
        let parent = runtime.take_mutable_snapshot().unwrap();
        let before = parent.id();
        let child = parent.take_nested_mutable_snapshot().unwrap();

        assert!(child.id() > before);
        assert!(parent.id() > child.id());
        assert!(parent.invalid_ids().get(child.id()));
        assert!(!child.invalid_ids().get(before));
    }
}
