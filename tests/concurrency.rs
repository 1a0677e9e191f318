//! Concurrency Tests
//!
//! - No lost updates under contention
//! - Readers always observe a consistent cut
//! - Apply notifications are delivered in publication order

use std::sync::{Arc, Mutex};
use std::thread;

use aerostate::{policy, SnapshotRuntime, StateCell};

const THREADS: usize = 4;
const ITERATIONS: usize = 100;

fn increment_with_retry(runtime: &SnapshotRuntime, cell: &StateCell<u64>) -> u64 {
    let mut retries = 0;
    loop {
        let snapshot = runtime.take_mutable_snapshot().unwrap();
        snapshot.enter(|| cell.update(|v| v + 1)).unwrap();
        match snapshot.apply() {
            Ok(()) => return retries,
            Err(e) => {
                assert!(e.is_retryable(), "unexpected error: {}", e);
                snapshot.dispose().unwrap();
                retries += 1;
            }
        }
    }
}

#[test]
fn test_no_lost_updates_with_retry() {
    let runtime = SnapshotRuntime::new();
    let counter = Arc::new(runtime.create_cell(0u64));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let runtime = runtime.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    increment_with_retry(&runtime, &counter);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(counter.get().unwrap(), (THREADS * ITERATIONS) as u64);
    assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
}

#[test]
fn test_merging_counter_never_conflicts() {
    let runtime = SnapshotRuntime::new();
    let counter = Arc::new(runtime.create_cell_with_policy(0i64, policy::add_deltas()));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let runtime = runtime.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    runtime
                        .with_mutable_snapshot(|| counter.update(|v| v + 1))
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(counter.get().unwrap(), (THREADS * ITERATIONS) as i64);
    assert_eq!(runtime.metrics().apply_conflicts, 0);
}

/// Writers move units between two cells; every snapshot must see the
/// total unchanged.
#[test]
fn test_readers_see_consistent_cut() {
    let runtime = SnapshotRuntime::new();
    let left = Arc::new(runtime.create_cell(100i64));
    let right = Arc::new(runtime.create_cell(0i64));

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let runtime = runtime.clone();
            let (left, right) = (Arc::clone(&left), Arc::clone(&right));
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    loop {
                        let snapshot = runtime.take_mutable_snapshot().unwrap();
                        snapshot
                            .enter(|| {
                                left.update(|v| v - 1)?;
                                right.update(|v| v + 1)
                            })
                            .unwrap();
                        if snapshot.apply().is_ok() {
                            break;
                        }
                        snapshot.dispose().unwrap();
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let runtime = runtime.clone();
            let (left, right) = (Arc::clone(&left), Arc::clone(&right));
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let snapshot = runtime.take_snapshot().unwrap();
                    let l = snapshot.read(&left).unwrap();
                    let r = snapshot.read(&right).unwrap();
                    assert_eq!(l + r, 100);
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    assert_eq!(left.get().unwrap(), 100 - 2 * ITERATIONS as i64);
    assert_eq!(right.get().unwrap(), 2 * ITERATIONS as i64);
}

#[test]
fn test_notifications_in_version_order() {
    let runtime = SnapshotRuntime::new();
    let counter = Arc::new(runtime.create_cell(0u64));
    let versions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&versions);
    let _handle = runtime.register_apply_observer(move |change| {
        sink.lock().unwrap().push(change.version);
    });

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let runtime = runtime.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..ITERATIONS / 4 {
                    increment_with_retry(&runtime, &counter);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let versions = versions.lock().unwrap();
    assert_eq!(versions.len(), THREADS * (ITERATIONS / 4));
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
}

/// An apply issued from inside an observer is delivered after the
/// notification that triggered it, on the same thread.
#[test]
fn test_reentrant_apply_from_observer() {
    let runtime = SnapshotRuntime::new();
    let source = Arc::new(runtime.create_cell(0));
    let mirror = Arc::new(runtime.create_cell(0));
    let log = Arc::new(Mutex::new(Vec::new()));

    let observer_runtime = runtime.clone();
    let (src, dst) = (Arc::clone(&source), Arc::clone(&mirror));
    let sink = Arc::clone(&log);
    let _handle = runtime.register_apply_observer(move |change| {
        sink.lock().unwrap().push(change.cells.clone());
        if change.contains(src.id()) {
            let value = observer_runtime.global(|| src.get().unwrap());
            observer_runtime
                .with_mutable_snapshot(|| dst.set(value))
                .unwrap();
        }
    });

    runtime.with_mutable_snapshot(|| source.set(7)).unwrap();

    assert_eq!(mirror.get().unwrap(), 7);
    let log = log.lock().unwrap();
    assert_eq!(*log, vec![vec![source.id()], vec![mirror.id()]]);
}
