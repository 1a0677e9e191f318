//! Apply/Merge Engine
//!
//! Commit protocol for mutable snapshots:
//!
//! 1. Under the runtime lock, stage every written cell: compare the record
//!    the snapshot started from with the record its target holds now. An
//!    unchanged record is clean; a changed one goes to the cell's merge
//!    policy, and a missing policy or a rejected merge fails the apply.
//! 2. Only when every cell staged, publish: root snapshots copy each value
//!    into a record stamped with a fresh version, nested snapshots write
//!    into their parent's records.
//! 3. Root applies advance the global snapshot and enqueue change sets;
//!    delivery happens after the lock is released.
//!
//! Staging never mutates a ring, so a failed apply leaves no trace.

use std::sync::Arc;

use super::errors::{SnapshotError, SnapshotResult};
use super::handle::{self, Snapshot, SnapshotCore, SnapshotInner};
use super::lifecycle::SnapshotState;
use super::runtime::RuntimeShared;
use crate::mvcc::{SnapshotId, SnapshotIdSet};
use crate::observability::{log_event, Event, ObservationScope};
use crate::observer::{ChangeOrigin, ChangeSet, Ticket};
use crate::state::{ApplyView, CellId, StagedValue, StateObject};

type Staged = Vec<(Arc<dyn StateObject>, StagedValue)>;

/// Stage every modified cell of `core` against `current`.
fn stage_all(
    shared: &RuntimeShared,
    core: &SnapshotCore,
    current: SnapshotId,
    current_invalid: &SnapshotIdSet,
) -> SnapshotResult<Staged> {
    let base_invalid = core.invalid.set(core.id).or(&core.previous_ids);
    let view = ApplyView {
        snapshot: core.id,
        invalid: &core.invalid,
        base_invalid: &base_invalid,
        current,
        current_invalid,
    };

    let mut staged = Vec::with_capacity(core.modified.len());
    for object in core.modified.values() {
        let value = object.stage_apply(&view)?;
        if let Some(policy) = value.merged_by {
            shared.metrics.increment_merges();
            log_event(
                Event::SnapshotMerge,
                &[
                    ("cell", &object.id().to_string()),
                    ("policy", policy),
                    ("snapshot", &core.id.to_string()),
                ],
            );
        }
        staged.push((Arc::clone(object), value));
    }
    Ok(staged)
}

fn report_failure(shared: &RuntimeShared, scope: ObservationScope, err: &SnapshotError) {
    match err {
        SnapshotError::ApplyConflict { snapshot, cell, .. } => {
            shared.metrics.increment_apply_conflicts();
            log_event(
                Event::SnapshotApplyConflict,
                &[("cell", &cell.to_string()), ("snapshot", &snapshot.to_string())],
            );
            scope.fail(err.code());
        }
        SnapshotError::RecordCorruption { cell, snapshot, detail } => {
            log_event(
                Event::RecordCorruption,
                &[
                    ("cell", &cell.to_string()),
                    ("detail", detail),
                    ("snapshot", &snapshot.to_string()),
                ],
            );
            scope.fail_fatal(&err.to_string());
        }
        _ if err.is_fatal() => scope.fail_fatal(&err.to_string()),
        _ => scope.fail(err.code()),
    }
}

fn ensure_writable(inner: &SnapshotInner, core: &SnapshotCore) -> SnapshotResult<()> {
    core.ensure_open("apply")?;
    if inner.kind.is_read_only() {
        return Err(SnapshotError::IllegalWrite { snapshot: core.id });
    }
    Ok(())
}

/// Apply a root mutable snapshot into global state.
pub(crate) fn apply_root(inner: &SnapshotInner) -> SnapshotResult<()> {
    let shared = &inner.runtime.shared;
    let snapshot_id = inner.lock_core()?.id;
    let scope =
        ObservationScope::with_fields("SNAPSHOT_APPLY", vec![("snapshot", snapshot_id.to_string())]);

    match publish_root(inner, shared) {
        Ok((cells, tickets)) => {
            for ticket in tickets {
                inner.runtime.deliver(ticket)?;
            }
            scope.complete_with_fields(&[("cells", &cells.to_string())]);
            Ok(())
        }
        Err(err) => {
            report_failure(shared, scope, &err);
            Err(err)
        }
    }
}

/// The locked part of a root apply. Returns the number of cells published
/// and the delivery tickets to wait for.
///
/// Every successful root apply advances the global snapshot, so pending
/// global writes are published even when the snapshot wrote nothing.
fn publish_root(
    inner: &SnapshotInner,
    shared: &RuntimeShared,
) -> SnapshotResult<(usize, Vec<Ticket>)> {
    let mut state = shared.lock_state()?;
    let mut core = inner.lock_core()?;
    ensure_writable(inner, &core)?;

    let published = if core.modified.is_empty() {
        None
    } else {
        // Latest published state, pending global writes included.
        let current = state.clock.peek();
        let current_invalid = state.registry.open_ids().clear(state.global.id);
        let staged = stage_all(shared, &core, current, &current_invalid)?;

        let version = state.clock.next_version();
        let watermark = shared.watermark.get();
        let mut cells: Vec<CellId> = Vec::with_capacity(staged.len());
        for (object, value) in staged {
            let outcome = object.publish(version, value, watermark)?;
            shared.record_write(outcome);
            state.track(&object);
            cells.push(object.id());
        }
        Some((version, cells))
    };

    let own = core.own_ids();
    state.close_ids(&own);
    state.release_pin(core.pin.take());
    core.modified.clear();
    core.state = SnapshotState::Applied;
    handle::settle(&mut state, inner.kind, &mut core)?;
    shared.metrics.increment_snapshots_applied();

    let mut tickets = Vec::with_capacity(2);
    if let Some(global) = shared.advance_global(&mut state)? {
        tickets.push(shared.delivery.enqueue(global)?);
    }

    let count = match published {
        Some((version, cells)) => {
            log_event(
                Event::SnapshotApply,
                &[
                    ("cells", &cells.len().to_string()),
                    ("snapshot", &core.id.to_string()),
                    ("version", &version.to_string()),
                ],
            );
            let count = cells.len();
            tickets.push(shared.delivery.enqueue(ChangeSet::new(
                core.id,
                version,
                cells,
                ChangeOrigin::Applied,
            ))?);
            count
        }
        None => {
            log_event(
                Event::SnapshotApply,
                &[("cells", "0"), ("snapshot", &core.id.to_string())],
            );
            0
        }
    };

    if shared.config.reclaim_on_apply {
        shared.reclaim_locked(&mut state)?;
    }
    Ok((count, tickets))
}

/// Apply a nested mutable snapshot into its parent.
pub(crate) fn apply_nested(inner: &SnapshotInner, parent: &Snapshot) -> SnapshotResult<()> {
    let shared = &inner.runtime.shared;
    let parent_id = parent.id();
    let snapshot_id = inner.lock_core()?.id;
    let scope = ObservationScope::with_fields(
        "SNAPSHOT_APPLY",
        vec![
            ("snapshot", snapshot_id.to_string()),
            ("parent", parent_id.to_string()),
        ],
    );

    match publish_nested(inner, parent, shared) {
        Ok(cells) => {
            scope.complete_with_fields(&[("cells", &cells.to_string())]);
            Ok(())
        }
        Err(err) => {
            report_failure(shared, scope, &err);
            Err(err)
        }
    }
}

fn publish_nested(
    inner: &SnapshotInner,
    parent: &Snapshot,
    shared: &RuntimeShared,
) -> SnapshotResult<usize> {
    let mut state = shared.lock_state()?;
    let mut target = parent.inner.lock_core()?;
    let mut core = inner.lock_core()?;
    ensure_writable(inner, &core)?;
    if target.state != SnapshotState::Open {
        return Err(SnapshotError::illegal_state(
            target.id,
            target.state,
            "apply into",
        ));
    }

    let own = core.own_ids();
    let count = core.modified.len();
    if count > 0 {
        let staged = stage_all(shared, &core, target.id, &target.invalid)?;
        let watermark = shared.watermark.get();
        for (object, value) in staged {
            let outcome = object.absorb(target.id, &target.invalid, value, watermark)?;
            shared.record_write(outcome);
            target.modified.insert(object.id(), object);
        }
        // The child's records stay hidden from everyone but stay open
        // until the parent itself closes.
        target.previous_ids = target.previous_ids.or(&own);
    } else {
        state.close_ids(&own);
    }

    state.release_pin(core.pin.take());
    core.modified.clear();
    core.state = SnapshotState::Applied;
    // A child with open children of its own stays counted until they settle.
    if handle::settle(&mut state, inner.kind, &mut core)? {
        target.active_children = target.active_children.saturating_sub(1);
    }
    shared.metrics.increment_snapshots_applied();
    log_event(
        Event::SnapshotApply,
        &[
            ("cells", &count.to_string()),
            ("parent", &target.id.to_string()),
            ("snapshot", &core.id.to_string()),
        ],
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use crate::snapshot::{SnapshotError, SnapshotRuntime, SnapshotState};
    use crate::state::policy;

    #[test]
    fn test_apply_publishes_to_new_snapshots() {
        let runtime = SnapshotRuntime::new();
        let counter = runtime.create_cell(0);

        let s1 = runtime.take_mutable_snapshot().unwrap();
        s1.write(&counter, 1).unwrap();
        let r = runtime.take_snapshot().unwrap();
        assert_eq!(r.read(&counter).unwrap(), 0);

        s1.apply().unwrap();
        assert_eq!(s1.state(), SnapshotState::Applied);
        let r2 = runtime.take_snapshot().unwrap();
        assert_eq!(r2.read(&counter).unwrap(), 1);
        assert_eq!(r.read(&counter).unwrap(), 0);
        assert_eq!(counter.get().unwrap(), 1);
    }

    #[test]
    fn test_conflict_keeps_snapshot_open() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_labeled_cell("title", "a".to_string(), None);

        let s1 = runtime.take_mutable_snapshot().unwrap();
        let s2 = runtime.take_mutable_snapshot().unwrap();
        s1.write(&cell, "b".to_string()).unwrap();
        s2.write(&cell, "c".to_string()).unwrap();
        s1.apply().unwrap();

        let err = s2.apply().unwrap_err();
        assert!(matches!(
            &err,
            SnapshotError::ApplyConflict { label: Some(l), .. } if l == "title"
        ));
        assert!(s2.is_open());
        assert_eq!(cell.get().unwrap(), "b");
        assert_eq!(runtime.metrics().apply_conflicts, 1);

        s2.dispose().unwrap();
    }

    #[test]
    fn test_add_deltas_merge() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell_with_policy(10i64, policy::add_deltas());

        let s1 = runtime.take_mutable_snapshot().unwrap();
        let s2 = runtime.take_mutable_snapshot().unwrap();
        s1.write(&cell, 11).unwrap();
        s2.write(&cell, 15).unwrap();
        s1.apply().unwrap();
        s2.apply().unwrap();

        assert_eq!(cell.get().unwrap(), 16);
        assert_eq!(runtime.metrics().merges, 1);
    }

    #[test]
    fn test_all_or_nothing() {
        let runtime = SnapshotRuntime::new();
        let free = runtime.create_cell(0);
        let contested = runtime.create_cell(0);

        let s1 = runtime.take_mutable_snapshot().unwrap();
        let s2 = runtime.take_mutable_snapshot().unwrap();
        s1.write(&contested, 1).unwrap();
        s2.write(&free, 2).unwrap();
        s2.write(&contested, 2).unwrap();
        s1.apply().unwrap();

        assert!(s2.apply().is_err());
        assert_eq!(free.get().unwrap(), 0);
    }

    #[test]
    fn test_empty_apply_closes_snapshot() {
        let runtime = SnapshotRuntime::new();
        let snapshot = runtime.take_mutable_snapshot().unwrap();
        snapshot.apply().unwrap();
        assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
        assert_eq!(runtime.metrics().snapshots_applied, 1);
    }

    #[test]
    fn test_apply_read_only_is_illegal_write() {
        let runtime = SnapshotRuntime::new();
        let snapshot = runtime.take_snapshot().unwrap();
        assert!(matches!(
            snapshot.apply().unwrap_err(),
            SnapshotError::IllegalWrite { .. }
        ));
    }

    #[test]
    fn test_second_apply_is_illegal_state() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let snapshot = runtime.take_mutable_snapshot().unwrap();
        snapshot.write(&cell, 1).unwrap();
        snapshot.apply().unwrap();

        let err = snapshot.apply().unwrap_err();
        assert_eq!(err.code(), "AERO_SNAPSHOT_ILLEGAL_STATE");
        // An applied snapshot may still be disposed once.
        snapshot.dispose().unwrap();
        assert_eq!(snapshot.state(), SnapshotState::Disposed);
    }

    #[test]
    fn test_nested_apply_into_parent() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let parent = runtime.take_mutable_snapshot().unwrap();
        let child = parent.take_nested_mutable_snapshot().unwrap();

        child.write(&cell, 7).unwrap();
        assert_eq!(parent.read(&cell).unwrap(), 0);
        child.apply().unwrap();
        assert_eq!(parent.read(&cell).unwrap(), 7);
        assert_eq!(cell.get().unwrap(), 0);

        parent.apply().unwrap();
        assert_eq!(cell.get().unwrap(), 7);
        assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
    }

    #[test]
    fn test_nested_apply_into_closed_parent() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let parent = runtime.take_mutable_snapshot().unwrap();
        let child = parent.take_nested_mutable_snapshot().unwrap();
        child.write(&cell, 1).unwrap();
        parent.dispose().unwrap();

        let err = child.apply().unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::IllegalStateUse { operation: "apply into", .. }
        ));
    }
}
