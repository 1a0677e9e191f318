//! Snapshot Runtime
//!
//! The runtime is the explicit process context of the engine. It owns:
//! - The version clock and the registry of open snapshots
//! - The global snapshot, always open, which receives writes made outside
//!   any entered snapshot
//! - Observer registries, the delivery queue, metrics and configuration
//!
//! # Critical section
//!
//! One mutex guards the clock, the registry, the global snapshot and the
//! reclamation list. Lock order, outermost first:
//!
//! ```text
//! runtime state -> parent snapshot core -> snapshot core -> cell records
//! global view (read) -> cell records
//! ```
//!
//! Observers are always called after the critical section is released.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use super::config::RuntimeConfig;
use super::context::{self, Frame};
use super::errors::{poisoned, SnapshotError, SnapshotResult};
use super::handle::{Snapshot, SnapshotCore};
use super::lifecycle::SnapshotKind;
use crate::mvcc::{
    PinHandle, ReclaimReport, SnapshotId, SnapshotIdSet, SnapshotRegistry, VersionClock, Watermark,
};
use crate::observability::{log_event, Event, Logger, MetricsRegistry, MetricsSnapshot};
use crate::observer::{
    ChangeOrigin, ChangeSet, DeliveryQueue, ObserverHandle, ObserverRegistry, SnapshotObservers,
    Ticket,
};
use crate::state::{CellId, MergePolicy, RecordWrite, StateCell, StateObject};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique runtime identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(u64);

impl RuntimeId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Id and invalid set global reads run against.
#[derive(Debug)]
pub(crate) struct GlobalView {
    pub id: SnapshotId,
    pub invalid: SnapshotIdSet,
}

pub(crate) struct GlobalSnapshot {
    pub id: SnapshotId,
    pub invalid: SnapshotIdSet,
    pub pin: Option<PinHandle>,
    pub modified: BTreeMap<CellId, Weak<dyn StateObject>>,
}

pub(crate) struct RuntimeState {
    pub clock: VersionClock,
    pub registry: SnapshotRegistry,
    pub global: GlobalSnapshot,
    /// Cells that may hold reclaimable records
    pub tracked: HashMap<CellId, Weak<dyn StateObject>>,
}

impl RuntimeState {
    /// Allocate an id, register it open and pin it.
    pub fn open_id(&mut self, invalid: &SnapshotIdSet) -> (SnapshotId, PinHandle) {
        let id = self.clock.next_version();
        self.registry.register_open(id);
        let pin = self.registry.pin(id, invalid);
        (id, pin)
    }

    pub fn close_ids(&mut self, ids: &SnapshotIdSet) {
        let next = self.clock.peek();
        self.registry.register_closed_all(ids, next);
    }

    pub fn release_pin(&mut self, pin: Option<PinHandle>) {
        if let Some(pin) = pin {
            let next = self.clock.peek();
            self.registry.release_pin(pin, next);
        }
    }

    pub fn track(&mut self, object: &Arc<dyn StateObject>) {
        self.tracked.insert(object.id(), Arc::downgrade(object));
    }
}

pub(crate) struct RuntimeShared {
    pub id: RuntimeId,
    pub config: RuntimeConfig,
    pub state: Mutex<RuntimeState>,
    pub global_view: RwLock<GlobalView>,
    pub watermark: Watermark,
    pub observers: Arc<ObserverRegistry>,
    pub delivery: DeliveryQueue,
    pub metrics: MetricsRegistry,
    pub observation_enabled: AtomicBool,
}

impl RuntimeShared {
    pub fn lock_state(&self) -> SnapshotResult<std::sync::MutexGuard<'_, RuntimeState>> {
        self.state.lock().map_err(poisoned("runtime state"))
    }

    /// Close the global snapshot and open a fresh one.
    ///
    /// Returns the change set for the cells written globally, if any.
    pub fn advance_global(&self, state: &mut RuntimeState) -> SnapshotResult<Option<ChangeSet>> {
        let modified = std::mem::take(&mut state.global.modified);
        let old_id = state.global.id;

        let next = state.clock.peek();
        state.registry.register_closed(old_id, next);
        let invalid = state.registry.open_ids().clone();
        let (new_id, pin) = state.open_id(&invalid);

        {
            let mut view = self.global_view.write().map_err(poisoned("global view"))?;
            view.id = new_id;
            view.invalid = invalid.clone();
        }
        state.global.id = new_id;
        state.global.invalid = invalid;
        // Released only after readers moved to the new view.
        let old_pin = state.global.pin.replace(pin);
        state.release_pin(old_pin);

        self.metrics.increment_global_advances();
        log_event(
            Event::GlobalAdvance,
            &[
                ("from", &old_id.to_string()),
                ("to", &new_id.to_string()),
                ("cells", &modified.len().to_string()),
            ],
        );

        if modified.is_empty() {
            return Ok(None);
        }
        let cells: Vec<CellId> = modified.keys().copied().collect();
        state.tracked.extend(modified);
        Ok(Some(ChangeSet::new(
            old_id,
            new_id,
            cells,
            ChangeOrigin::GlobalWrites,
        )))
    }

    /// Sweep tracked cells against the current low watermark.
    pub fn reclaim_locked(&self, state: &mut RuntimeState) -> SnapshotResult<ReclaimReport> {
        let watermark = state.registry.low_watermark(state.clock.peek());
        let mut report = ReclaimReport::default();
        let mut revisit = HashMap::new();

        for (id, weak) in std::mem::take(&mut state.tracked) {
            let Some(object) = weak.upgrade() else {
                continue;
            };
            let sweep = object.sweep(watermark)?;
            report.record(sweep);
            if sweep.needs_revisit() {
                revisit.insert(id, weak);
            }
        }
        state.tracked = revisit;

        if report.records_reclaimed > 0 {
            self.metrics
                .add_records_reclaimed(report.records_reclaimed as u64);
            log_event(
                Event::RecordsReclaimed,
                &[
                    ("cells", &report.cells_scanned.to_string()),
                    ("records", &report.records_reclaimed.to_string()),
                    ("watermark", &watermark.to_string()),
                ],
            );
        }
        Ok(report)
    }

    pub fn record_write(&self, outcome: RecordWrite) {
        match outcome {
            RecordWrite::InPlace => {}
            RecordWrite::Reused => self.metrics.increment_records_reused(),
            RecordWrite::Allocated => self.metrics.increment_records_allocated(),
        }
    }

    pub fn observation_enabled(&self) -> bool {
        self.observation_enabled.load(Ordering::Acquire)
    }
}

/// Handle to a snapshot runtime.
///
/// Cheap to clone; all clones share the same state. The runtime lives until
/// the last handle, cell and snapshot referring to it is dropped.
#[derive(Clone)]
pub struct SnapshotRuntime {
    pub(crate) shared: Arc<RuntimeShared>,
}

impl SnapshotRuntime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::build(RuntimeConfig::default())
    }

    /// Create a runtime with a validated configuration.
    pub fn with_config(config: RuntimeConfig) -> SnapshotResult<Self> {
        config.validate()?;
        Logger::set_min_severity(config.log_level);
        Ok(Self::build(config))
    }

    fn build(config: RuntimeConfig) -> Self {
        let mut clock = VersionClock::new();
        let mut registry = SnapshotRegistry::new();
        let watermark = registry.watermark();

        let invalid = registry.open_ids().clone();
        let global_id = clock.next_version();
        registry.register_open(global_id);
        let pin = registry.pin(global_id, &invalid);

        let id = RuntimeId(NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed));
        let observation_enabled = AtomicBool::new(config.observation_enabled);
        log_event(
            Event::RuntimeStart,
            &[
                ("runtime", &id.value().to_string()),
                ("global", &global_id.to_string()),
            ],
        );

        Self {
            shared: Arc::new(RuntimeShared {
                id,
                config,
                state: Mutex::new(RuntimeState {
                    clock,
                    registry,
                    global: GlobalSnapshot {
                        id: global_id,
                        invalid: invalid.clone(),
                        pin: Some(pin),
                        modified: BTreeMap::new(),
                    },
                    tracked: HashMap::new(),
                }),
                global_view: RwLock::new(GlobalView {
                    id: global_id,
                    invalid,
                }),
                watermark,
                observers: Arc::new(ObserverRegistry::new()),
                delivery: DeliveryQueue::new(),
                metrics: MetricsRegistry::new(),
                observation_enabled,
            }),
        }
    }

    pub fn id(&self) -> RuntimeId {
        self.shared.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    // ==================
    // Cells
    // ==================

    /// Allocate a cell without a merge policy.
    pub fn create_cell<V>(&self, initial: V) -> StateCell<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        StateCell::new(self.clone(), initial, None, None)
    }

    /// Allocate a cell whose concurrent writes are reconciled by `policy`.
    pub fn create_cell_with_policy<V>(&self, initial: V, policy: MergePolicy<V>) -> StateCell<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        StateCell::new(self.clone(), initial, None, Some(policy))
    }

    /// Allocate a cell with a label used in errors and logs.
    pub fn create_labeled_cell<V>(
        &self,
        label: impl Into<String>,
        initial: V,
        policy: Option<MergePolicy<V>>,
    ) -> StateCell<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        StateCell::new(self.clone(), initial, Some(label.into()), policy)
    }

    // ==================
    // Snapshots
    // ==================

    /// Open a read-only snapshot of the latest published state.
    pub fn take_snapshot(&self) -> SnapshotResult<Snapshot> {
        self.open_root(SnapshotKind::ReadOnly, SnapshotObservers::new())
    }

    /// Open a read-only snapshot whose reads are reported to `observers`.
    pub fn take_snapshot_with_observers(
        &self,
        observers: SnapshotObservers,
    ) -> SnapshotResult<Snapshot> {
        self.open_root(SnapshotKind::ReadOnly, observers)
    }

    /// Open a mutable snapshot of the latest published state.
    pub fn take_mutable_snapshot(&self) -> SnapshotResult<Snapshot> {
        self.open_root(SnapshotKind::Mutable, SnapshotObservers::new())
    }

    /// Open a mutable snapshot reporting its reads and first writes to
    /// `observers`. Nested snapshots taken from it inherit them.
    pub fn take_mutable_snapshot_with_observers(
        &self,
        observers: SnapshotObservers,
    ) -> SnapshotResult<Snapshot> {
        self.open_root(SnapshotKind::Mutable, observers)
    }

    fn open_root(&self, kind: SnapshotKind, observers: SnapshotObservers) -> SnapshotResult<Snapshot> {
        let (core, ticket) = {
            let mut state = self.shared.lock_state()?;
            self.check_open_limit(&state, 1)?;

            // Pending global writes become visible to the new snapshot.
            let ticket = if state.global.modified.is_empty() {
                None
            } else {
                self.advance_global_and_enqueue(&mut state)?
            };

            let invalid = state.registry.open_ids().clone();
            let (id, pin) = state.open_id(&invalid);
            self.shared.metrics.increment_snapshots_opened();
            log_event(
                Event::SnapshotOpen,
                &[("kind", kind.as_str()), ("snapshot", &id.to_string())],
            );
            (SnapshotCore::new(id, invalid, true, pin), ticket)
        };

        let snapshot = Snapshot::new(self.clone(), kind, None, observers, core);
        if let Some(ticket) = ticket {
            self.deliver(ticket)?;
        }
        Ok(snapshot)
    }

    /// Fail when registering `opening` more ids would pass the limit.
    pub(crate) fn check_open_limit(&self, state: &RuntimeState, opening: usize) -> SnapshotResult<()> {
        let open = state.registry.open_count();
        if self.shared.config.exceeds_open_limit(open, opening) {
            return Err(SnapshotError::Config(format!(
                "open snapshot limit reached ({} open, {} requested, limit {})",
                open, opening, self.shared.config.max_open_snapshots
            )));
        }
        Ok(())
    }

    /// Take a mutable snapshot, run `block` inside it and apply.
    ///
    /// When `block` fails the snapshot is disposed and the error returned.
    pub fn with_mutable_snapshot<R, F>(&self, block: F) -> SnapshotResult<R>
    where
        F: FnOnce() -> SnapshotResult<R>,
    {
        let snapshot = self.take_mutable_snapshot()?;
        match snapshot.enter(block) {
            Ok(value) => {
                snapshot.apply()?;
                Ok(value)
            }
            Err(e) => {
                snapshot.dispose()?;
                Err(e)
            }
        }
    }

    /// The snapshot entered on this thread, if any.
    pub fn current_snapshot(&self) -> Option<Snapshot> {
        context::current_for(self.id())
    }

    /// Run `block` against the global snapshot, hiding entered snapshots.
    pub fn global<R, F: FnOnce() -> R>(&self, block: F) -> R {
        context::with_frame(Frame::Global(self.id()), block)
    }

    /// Id of the current global snapshot
    pub fn global_snapshot_id(&self) -> SnapshotId {
        self.shared
            .global_view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
    }

    /// Number of ids registered open, the global snapshot's included
    pub fn open_snapshot_count(&self) -> SnapshotResult<usize> {
        Ok(self.shared.lock_state()?.registry.open_count())
    }

    // ==================
    // Global snapshot
    // ==================

    pub(crate) fn read_global<V>(&self, cell: &StateCell<V>) -> SnapshotResult<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        if self.shared.observation_enabled() {
            context::notify_read(self.id(), cell.id());
        }
        let view = self.shared.global_view.read().map_err(poisoned("global view"))?;
        cell.read_at(view.id, &view.invalid)
    }

    pub(crate) fn write_global<V>(&self, cell: &StateCell<V>, value: V) -> SnapshotResult<()>
    where
        V: Clone + Send + Sync + 'static,
    {
        {
            let mut state = self.shared.lock_state()?;
            let watermark = self.shared.watermark.get();
            let global_id = state.global.id;
            let invalid = state.global.invalid.clone();
            let outcome = cell.write_at(global_id, &invalid, value, watermark)?;
            state
                .global
                .modified
                .insert(cell.id(), Arc::downgrade(&cell.object()));
            self.shared.record_write(outcome);
        }
        if self.shared.observation_enabled() {
            self.shared.observers.notify_global_write(cell.id());
        }
        Ok(())
    }

    /// Publish pending global writes to apply observers.
    ///
    /// Returns false when nothing was written globally since the last advance.
    pub fn send_apply_notifications(&self) -> SnapshotResult<bool> {
        let ticket = {
            let mut state = self.shared.lock_state()?;
            if state.global.modified.is_empty() {
                return Ok(false);
            }
            let ticket = self.advance_global_and_enqueue(&mut state)?;
            if self.shared.config.reclaim_on_apply {
                self.shared.reclaim_locked(&mut state)?;
            }
            ticket
        };
        if let Some(ticket) = ticket {
            self.deliver(ticket)?;
        }
        Ok(true)
    }

    pub(crate) fn advance_global_and_enqueue(
        &self,
        state: &mut RuntimeState,
    ) -> SnapshotResult<Option<Ticket>> {
        match self.shared.advance_global(state)? {
            Some(change) => Ok(Some(self.shared.delivery.enqueue(change)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn deliver(&self, ticket: Ticket) -> SnapshotResult<()> {
        let shared = &self.shared;
        shared.delivery.deliver_through(ticket, |change| {
            shared.metrics.increment_notifications();
            shared.observers.notify_apply(change);
        })?;
        Ok(())
    }

    // ==================
    // Observation
    // ==================

    /// Register an observer called with every published change set.
    pub fn register_apply_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        let handle = self.shared.observers.register_apply(Arc::new(observer));
        log_event(Event::ObserverRegistered, &[("kind", "apply")]);
        handle
    }

    /// Register an observer called with each cell written globally.
    pub fn register_global_write_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(CellId) + Send + Sync + 'static,
    {
        let handle = self.shared.observers.register_global_write(Arc::new(observer));
        log_event(Event::ObserverRegistered, &[("kind", "global_write")]);
        handle
    }

    /// Run `block`, reporting every cell it reads to `on_read`.
    ///
    /// Hooks nest: an enclosing observation also sees the reads of `block`.
    pub fn observe_reads<S, R, H, F>(&self, scope: S, on_read: H, block: F) -> R
    where
        S: 'static,
        H: Fn(&S, CellId) + 'static,
        F: FnOnce() -> R,
    {
        let hook: Rc<dyn Fn(CellId)> = Rc::new(move |cell| on_read(&scope, cell));
        context::with_read_hook(self.id(), hook, block)
    }

    /// Run `block` with read hooks on this thread suspended.
    pub fn without_read_observation<R, F: FnOnce() -> R>(&self, block: F) -> R {
        context::without_read_hooks(block)
    }

    /// Process-wide toggle for read hooks and global write observers.
    pub fn set_observation_enabled(&self, enabled: bool) {
        self.shared
            .observation_enabled
            .store(enabled, Ordering::Release);
    }

    pub fn is_observation_enabled(&self) -> bool {
        self.shared.observation_enabled()
    }

    // ==================
    // Reclamation & metrics
    // ==================

    /// Sweep records no open snapshot can observe.
    pub fn reclaim(&self) -> SnapshotResult<ReclaimReport> {
        let mut state = self.shared.lock_state()?;
        self.shared.reclaim_locked(&mut state)
    }

    /// Lowest id an open snapshot may still need
    pub fn low_watermark(&self) -> SnapshotResult<SnapshotId> {
        let state = self.shared.lock_state()?;
        Ok(state.registry.low_watermark(state.clock.peek()))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Default for SnapshotRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SnapshotRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotRuntime")
            .field("id", &self.shared.id)
            .field("global", &self.global_snapshot_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_new_runtime_has_only_global_open() {
        let runtime = SnapshotRuntime::new();
        assert_eq!(runtime.open_snapshot_count().unwrap(), 1);
        assert_eq!(runtime.global_snapshot_id(), SnapshotId::FIRST);
    }

    #[test]
    fn test_runtime_ids_are_unique() {
        assert_ne!(SnapshotRuntime::new().id(), SnapshotRuntime::new().id());
    }

    #[test]
    fn test_global_write_and_read() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(1);
        cell.set(2).unwrap();
        assert_eq!(cell.get().unwrap(), 2);
        // Repeated global writes update the same record.
        cell.set(3).unwrap();
        assert_eq!(cell.record_count(), 2);
    }

    #[test]
    fn test_send_apply_notifications() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _handle = {
            let seen = Arc::clone(&seen);
            runtime.register_apply_observer(move |change| seen.lock().unwrap().push(change.clone()))
        };

        assert!(!runtime.send_apply_notifications().unwrap());
        cell.set(5).unwrap();
        let before = runtime.global_snapshot_id();
        assert!(runtime.send_apply_notifications().unwrap());
        assert!(runtime.global_snapshot_id() > before);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, ChangeOrigin::GlobalWrites);
        assert_eq!(seen[0].cells, vec![cell.id()]);
    }

    #[test]
    fn test_global_write_observer_respects_toggle() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let count = Arc::new(AtomicU64::new(0));
        let _handle = {
            let count = Arc::clone(&count);
            runtime.register_global_write_observer(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        cell.set(1).unwrap();
        runtime.set_observation_enabled(false);
        cell.set(2).unwrap();
        runtime.set_observation_enabled(true);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_limit() {
        let runtime =
            SnapshotRuntime::with_config(RuntimeConfig::with_max_open_snapshots(2)).unwrap();
        let first = runtime.take_snapshot().unwrap();
        let err = runtime.take_snapshot().unwrap_err();
        assert_eq!(err.code(), "AERO_SNAPSHOT_CONFIG");

        first.dispose().unwrap();
        assert!(runtime.take_snapshot().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = SnapshotRuntime::with_config(RuntimeConfig::with_max_open_snapshots(1)).unwrap_err();
        assert!(matches!(err, SnapshotError::Config(_)));
    }

    #[test]
    fn test_global_block_hides_entered_snapshot() {
        let runtime = SnapshotRuntime::new();
        let cell = runtime.create_cell(0);
        let snapshot = runtime.take_mutable_snapshot().unwrap();

        snapshot.enter(|| {
            cell.set(1).unwrap();
            assert!(runtime.current_snapshot().is_some());
            runtime.global(|| {
                assert!(runtime.current_snapshot().is_none());
                assert_eq!(cell.get().unwrap(), 0);
            });
            assert_eq!(cell.get().unwrap(), 1);
        });
        snapshot.dispose().unwrap();
    }
}
