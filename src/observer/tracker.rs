//! Dependency Tracker
//!
//! Records which cells each scope read during its last observation, and maps
//! published change sets back to the scopes they invalidate.
//!
//! A scope is any caller-chosen key (a view id, a query name). Observing a
//! scope again replaces its read set, so stale dependencies never cause
//! spurious invalidation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::change_set::ChangeSet;
use super::registry::ObserverHandle;
use crate::snapshot::SnapshotRuntime;
use crate::state::CellId;

#[derive(Debug)]
struct ScopeEntry {
    /// First-observation order, used to report scopes deterministically
    seq: u64,
    reads: HashSet<CellId>,
}

#[derive(Debug)]
struct TrackerState<S> {
    scopes: HashMap<S, ScopeEntry>,
    readers: HashMap<CellId, HashSet<S>>,
    invalidated: VecDeque<S>,
    pending: HashSet<S>,
    next_seq: u64,
}

impl<S: Eq + Hash + Clone> TrackerState<S> {
    fn new() -> Self {
        Self {
            scopes: HashMap::new(),
            readers: HashMap::new(),
            invalidated: VecDeque::new(),
            pending: HashSet::new(),
            next_seq: 0,
        }
    }

    fn unlink(&mut self, scope: &S, reads: &HashSet<CellId>) {
        for cell in reads {
            if let Some(scopes) = self.readers.get_mut(cell) {
                scopes.remove(scope);
                if scopes.is_empty() {
                    self.readers.remove(cell);
                }
            }
        }
    }

    fn record(&mut self, scope: S, reads: HashSet<CellId>) {
        let seq = match self.scopes.remove(&scope) {
            Some(previous) => {
                self.unlink(&scope, &previous.reads);
                previous.seq
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        for cell in &reads {
            self.readers.entry(*cell).or_default().insert(scope.clone());
        }
        self.scopes.insert(scope, ScopeEntry { seq, reads });
    }

    fn affected_by(&self, change: &ChangeSet) -> Vec<S> {
        let mut affected: Vec<(u64, S)> = change
            .cells
            .iter()
            .filter_map(|cell| self.readers.get(cell))
            .flatten()
            .collect::<HashSet<&S>>()
            .into_iter()
            .filter_map(|scope| self.scopes.get(scope).map(|e| (e.seq, scope.clone())))
            .collect();
        affected.sort_by_key(|(seq, _)| *seq);
        affected.into_iter().map(|(_, scope)| scope).collect()
    }
}

/// Per-scope read sets with change-set invalidation.
pub struct DependencyTracker<S> {
    state: Arc<Mutex<TrackerState<S>>>,
}

impl<S> Clone for DependencyTracker<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Eq + Hash + Clone + Send + 'static> DependencyTracker<S> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::new())),
        }
    }

    // The tracker never runs caller code while holding its lock, so a
    // poisoned guard still holds consistent bookkeeping.
    fn lock(&self) -> MutexGuard<'_, TrackerState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `block` and record every cell it reads as a dependency of `scope`.
    ///
    /// Replaces the scope's previous read set and clears any pending
    /// invalidation for it.
    pub fn observe<R, F>(&self, runtime: &SnapshotRuntime, scope: S, block: F) -> R
    where
        F: FnOnce() -> R,
    {
        {
            let mut state = self.lock();
            if state.pending.remove(&scope) {
                state.invalidated.retain(|s| s != &scope);
            }
        }

        let reads = Rc::new(RefCell::new(HashSet::new()));
        let sink = Rc::clone(&reads);
        let result = runtime.observe_reads(
            scope.clone(),
            move |_: &S, cell| {
                sink.borrow_mut().insert(cell);
            },
            block,
        );

        let reads = reads.take();
        self.lock().record(scope, reads);
        result
    }

    /// Forget `scope` and its dependencies.
    pub fn clear(&self, scope: &S) {
        let mut state = self.lock();
        if let Some(entry) = state.scopes.remove(scope) {
            state.unlink(scope, &entry.reads);
        }
        if state.pending.remove(scope) {
            state.invalidated.retain(|s| s != scope);
        }
    }

    /// Forget every scope.
    pub fn clear_all(&self) {
        *self.lock() = TrackerState::new();
    }

    /// Scopes that read at least one cell in `change`, in first-observed order.
    pub fn affected_by(&self, change: &ChangeSet) -> Vec<S> {
        self.lock().affected_by(change)
    }

    /// Queue affected scopes for every change set published on `runtime`.
    ///
    /// Tracking stops when the returned handle is dropped.
    pub fn start(&self, runtime: &SnapshotRuntime) -> ObserverHandle {
        let state = Arc::clone(&self.state);
        runtime.register_apply_observer(move |change: &ChangeSet| {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            for scope in state.affected_by(change) {
                if state.pending.insert(scope.clone()) {
                    state.invalidated.push_back(scope);
                }
            }
        })
    }

    /// Take the queued invalidations, oldest first.
    pub fn drain_invalidated(&self) -> Vec<S> {
        let mut state = self.lock();
        state.pending.clear();
        state.invalidated.drain(..).collect()
    }

    /// Returns true if `scope` has a queued invalidation
    pub fn is_invalidated(&self, scope: &S) -> bool {
        self.lock().pending.contains(scope)
    }

    /// Cells `scope` read during its last observation, ascending.
    pub fn read_set(&self, scope: &S) -> Option<Vec<CellId>> {
        let state = self.lock();
        state.scopes.get(scope).map(|entry| {
            let mut cells: Vec<CellId> = entry.reads.iter().copied().collect();
            cells.sort_unstable();
            cells
        })
    }

    pub fn scope_count(&self) -> usize {
        self.lock().scopes.len()
    }
}

impl<S: Eq + Hash + Clone + Send + 'static> Default for DependencyTracker<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::SnapshotId;
    use crate::observer::ChangeOrigin;

    fn change(cells: &[u64]) -> ChangeSet {
        ChangeSet::new(
            SnapshotId::new(5),
            SnapshotId::new(6),
            cells.iter().map(|c| CellId::new(*c)).collect(),
            ChangeOrigin::Applied,
        )
    }

    fn reads(cells: &[u64]) -> HashSet<CellId> {
        cells.iter().map(|c| CellId::new(*c)).collect()
    }

    #[test]
    fn test_affected_scopes_in_first_observed_order() {
        let mut state = TrackerState::new();
        state.record("b", reads(&[1, 2]));
        state.record("a", reads(&[2]));
        state.record("c", reads(&[3]));

        assert_eq!(state.affected_by(&change(&[2])), vec!["b", "a"]);
        assert_eq!(state.affected_by(&change(&[3, 1])), vec!["b", "c"]);
        assert!(state.affected_by(&change(&[9])).is_empty());
    }

    #[test]
    fn test_record_replaces_previous_reads() {
        let mut state = TrackerState::new();
        state.record("view", reads(&[1, 2]));
        state.record("view", reads(&[3]));

        assert!(state.affected_by(&change(&[1])).is_empty());
        assert_eq!(state.affected_by(&change(&[3])), vec!["view"]);
        assert!(!state.readers.contains_key(&CellId::new(1)));
    }

    #[test]
    fn test_reobserved_scope_keeps_its_position() {
        let mut state = TrackerState::new();
        state.record("first", reads(&[1]));
        state.record("second", reads(&[1]));
        state.record("first", reads(&[1]));

        assert_eq!(state.affected_by(&change(&[1])), vec!["first", "second"]);
    }

    #[test]
    fn test_observe_and_invalidate() {
        let runtime = SnapshotRuntime::new();
        let a = runtime.create_cell(1);
        let b = runtime.create_cell(2);
        let tracker = DependencyTracker::new();
        let _handle = tracker.start(&runtime);

        let sum = tracker.observe(&runtime, "sum", || a.get().unwrap() + b.get().unwrap());
        assert_eq!(sum, 3);
        tracker.observe(&runtime, "only_b", || b.get().unwrap());

        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(tracker.read_set(&"sum"), Some(expected));

        runtime.with_mutable_snapshot(|| a.set(10)).unwrap();
        assert!(tracker.is_invalidated(&"sum"));
        assert!(!tracker.is_invalidated(&"only_b"));
        assert_eq!(tracker.drain_invalidated(), vec!["sum"]);
        assert!(tracker.drain_invalidated().is_empty());
    }

    #[test]
    fn test_clear_forgets_scope() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let tracker = DependencyTracker::new();

        tracker.observe(&runtime, 7u32, || cell.get().unwrap());
        assert_eq!(tracker.scope_count(), 1);

        tracker.clear(&7);
        assert_eq!(tracker.scope_count(), 0);
        assert!(tracker.read_set(&7).is_none());
    }
}
