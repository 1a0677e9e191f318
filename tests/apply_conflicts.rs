//! Apply Conflict Tests
//!
//! - A cell changed since a snapshot's base is a conflict
//! - Merge policies may resolve the conflict
//! - A failed apply publishes nothing

use std::sync::{Arc, Mutex};

use aerostate::{policy, ChangeOrigin, ChangeSet, MergePolicy, SnapshotError, SnapshotRuntime, SnapshotState};

// =============================================================================
// Conflict Detection
// =============================================================================

#[test]
fn test_second_writer_conflicts() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_labeled_cell("balance", 0, None);

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, 1).unwrap();
    second.write(&a, 2).unwrap();

    first.apply().unwrap();
    let err = second.apply().unwrap_err();

    assert!(err.is_retryable());
    assert!(!err.is_fatal());
    assert_eq!(err.code(), "AERO_SNAPSHOT_APPLY_CONFLICT");
    assert_eq!(err.conflicting_cell(), Some(a.id()));
    assert!(err.to_string().contains("balance"));

    // The losing snapshot stays open and keeps its view.
    assert_eq!(second.state(), SnapshotState::Open);
    assert_eq!(second.read(&a).unwrap(), 2);
    second.dispose().unwrap();

    assert_eq!(a.get().unwrap(), 1);
}

/// Conflicts are detected by identity: an equal concurrent value still
/// conflicts unless the cell opts in.
#[test]
fn test_equal_values_conflict_without_policy() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, 7).unwrap();
    second.write(&a, 7).unwrap();

    first.apply().unwrap();
    assert!(matches!(
        second.apply(),
        Err(SnapshotError::ApplyConflict { .. })
    ));
}

#[test]
fn test_structural_equality_accepts_equal_values() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell_with_policy(0, policy::structural_equality());

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, 7).unwrap();
    second.write(&a, 7).unwrap();

    first.apply().unwrap();
    second.apply().unwrap();
    assert_eq!(a.get().unwrap(), 7);

    // Different values are still rejected.
    let third = runtime.take_mutable_snapshot().unwrap();
    let fourth = runtime.take_mutable_snapshot().unwrap();
    third.write(&a, 8).unwrap();
    fourth.write(&a, 9).unwrap();
    third.apply().unwrap();
    assert!(fourth.apply().is_err());
}

/// A cell the snapshot only read is never a conflict.
#[test]
fn test_read_only_cells_do_not_conflict() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);
    let b = runtime.create_cell(0);

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, 1).unwrap();
    assert_eq!(second.read(&a).unwrap(), 0);
    second.write(&b, 1).unwrap();

    first.apply().unwrap();
    second.apply().unwrap();
    assert_eq!((a.get().unwrap(), b.get().unwrap()), (1, 1));
}

#[test]
fn test_global_write_conflicts_with_snapshot() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);

    let snapshot = runtime.take_mutable_snapshot().unwrap();
    snapshot.write(&a, 1).unwrap();
    a.set(9).unwrap();

    assert!(snapshot.apply().is_err());
    assert_eq!(a.get().unwrap(), 9);
}

/// A conflict on one cell keeps the snapshot's other writes unpublished.
#[test]
fn test_failed_apply_is_atomic() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);
    let b = runtime.create_cell(0);

    let winner = runtime.take_mutable_snapshot().unwrap();
    winner.write(&b, 5).unwrap();

    let loser = runtime.take_mutable_snapshot().unwrap();
    loser.write(&a, 1).unwrap();
    loser.write(&b, 1).unwrap();

    winner.apply().unwrap();
    assert_eq!(
        loser.apply().unwrap_err().conflicting_cell(),
        Some(b.id())
    );

    let view = runtime.take_snapshot().unwrap();
    assert_eq!(view.read(&a).unwrap(), 0);
    assert_eq!(view.read(&b).unwrap(), 5);
    assert_eq!(runtime.metrics().apply_conflicts, 1);
}

// =============================================================================
// Merge Policies
// =============================================================================

#[test]
fn test_add_deltas_merges_concurrent_increments() {
    let runtime = SnapshotRuntime::new();
    let total = runtime.create_cell_with_policy(10i64, policy::add_deltas());

    let left = runtime.take_mutable_snapshot().unwrap();
    let right = runtime.take_mutable_snapshot().unwrap();
    left.enter(|| total.update(|v| v + 2)).unwrap();
    right.enter(|| total.update(|v| v + 4)).unwrap();

    left.apply().unwrap();
    right.apply().unwrap();

    assert_eq!(total.get().unwrap(), 16);
    assert_eq!(runtime.metrics().merges, 1);
}

#[test]
fn test_last_writer_wins() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell_with_policy("init", policy::last_writer_wins());

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, "first").unwrap();
    second.write(&a, "second").unwrap();

    first.apply().unwrap();
    second.apply().unwrap();
    assert_eq!(a.get().unwrap(), "second");
}

#[test]
fn test_policy_sees_previous_applied_current() {
    let runtime = SnapshotRuntime::new();
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let policy = MergePolicy::new("record", move |previous: &i32, applied: &i32, current: &i32| {
        *sink.lock().unwrap() = Some((*previous, *applied, *current));
        None
    });
    let a = runtime.create_labeled_cell("a", 1, Some(policy));

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, 2).unwrap();
    second.write(&a, 3).unwrap();
    first.apply().unwrap();

    // A policy returning None rejects the merge.
    assert!(second.apply().is_err());
    assert_eq!(*seen.lock().unwrap(), Some((1, 3, 2)));
    assert_eq!(a.policy_name(), Some("record"));
}

// =============================================================================
// Notifications
// =============================================================================

#[test]
fn test_apply_notifies_observers() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);
    let b = runtime.create_cell(0);

    let changes: Arc<Mutex<Vec<ChangeSet>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    let _handle = runtime.register_apply_observer(move |change| {
        sink.lock().unwrap().push(change.clone());
    });

    let snapshot = runtime.take_mutable_snapshot().unwrap();
    snapshot.write(&b, 1).unwrap();
    snapshot.write(&a, 1).unwrap();
    let id = snapshot.id();
    snapshot.apply().unwrap();

    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].origin, ChangeOrigin::Applied);
    assert_eq!(changes[0].snapshot_id, id);
    assert!(changes[0].version > id);
    assert!(changes[0].contains(a.id()));
    assert!(changes[0].contains(b.id()));
}

#[test]
fn test_failed_apply_notifies_nobody() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    let _handle = runtime.register_apply_observer(move |_| *sink.lock().unwrap() += 1);

    let first = runtime.take_mutable_snapshot().unwrap();
    let second = runtime.take_mutable_snapshot().unwrap();
    first.write(&a, 1).unwrap();
    second.write(&a, 2).unwrap();
    first.apply().unwrap();
    let _ = second.apply();

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn test_empty_apply_still_succeeds() {
    let runtime = SnapshotRuntime::new();
    let snapshot = runtime.take_mutable_snapshot().unwrap();
    assert!(!snapshot.has_pending_changes());
    snapshot.apply().unwrap();
    assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
}

#[test]
fn test_empty_apply_publishes_pending_global_writes() {
    let runtime = SnapshotRuntime::new();
    let a = runtime.create_cell(0);
    let origins = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&origins);
    let _handle = runtime.register_apply_observer(move |change| {
        sink.lock().unwrap().push((change.origin, change.cells.clone()));
    });

    let snapshot = runtime.take_mutable_snapshot().unwrap();
    a.set(5).unwrap();
    let global_before = runtime.global_snapshot_id();

    snapshot.apply().unwrap();

    assert!(runtime.global_snapshot_id() > global_before);
    assert_eq!(
        *origins.lock().unwrap(),
        vec![(ChangeOrigin::GlobalWrites, vec![a.id()])]
    );
    // Nothing left for an explicit flush.
    assert!(!runtime.send_apply_notifications().unwrap());
    assert_eq!(runtime.take_snapshot().unwrap().read(&a).unwrap(), 5);
}
