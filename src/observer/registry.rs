//! Observer Registry
//!
//! Apply observers and global write observers for one runtime.
//!
//! Observers are called outside of the registry lock: the list is copied
//! first, so an observer may register or dispose observers while running.
//! A panicking observer never holds a registry lock, so a poisoned lock
//! still guards a consistent map and is recovered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use super::change_set::ChangeSet;
use crate::state::CellId;

/// Called with every published change set.
pub type ApplyObserver = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Called with each cell written through the global snapshot.
pub type GlobalWriteObserver = Arc<dyn Fn(CellId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverKind {
    Apply,
    GlobalWrite,
}

/// Registered observers, keyed by registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    apply: RwLock<BTreeMap<u64, ApplyObserver>>,
    global_write: RwLock<BTreeMap<u64, GlobalWriteObserver>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an apply observer.
    pub fn register_apply(self: &Arc<Self>, observer: ApplyObserver) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.apply).insert(id, observer);
        ObserverHandle::new(self, ObserverKind::Apply, id)
    }

    /// Register a global write observer.
    pub fn register_global_write(self: &Arc<Self>, observer: GlobalWriteObserver) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.global_write).insert(id, observer);
        ObserverHandle::new(self, ObserverKind::GlobalWrite, id)
    }

    /// Call every apply observer with `change`. Returns the number called.
    pub fn notify_apply(&self, change: &ChangeSet) -> usize {
        let observers: Vec<ApplyObserver> = read(&self.apply).values().cloned().collect();
        for observer in &observers {
            observer(change);
        }
        observers.len()
    }

    /// Call every global write observer with `cell`.
    pub fn notify_global_write(&self, cell: CellId) {
        let observers: Vec<GlobalWriteObserver> =
            read(&self.global_write).values().cloned().collect();
        for observer in &observers {
            observer(cell);
        }
    }

    /// Number of registered apply observers
    pub fn apply_count(&self) -> usize {
        read(&self.apply).len()
    }

    /// Number of registered global write observers
    pub fn global_write_count(&self) -> usize {
        read(&self.global_write).len()
    }

    fn unregister(&self, kind: ObserverKind, id: u64) {
        match kind {
            ObserverKind::Apply => {
                write(&self.apply).remove(&id);
            }
            ObserverKind::GlobalWrite => {
                write(&self.global_write).remove(&id);
            }
        }
    }
}

/// Registration handle.
///
/// Dropping the handle unregisters the observer.
pub struct ObserverHandle {
    registry: Weak<ObserverRegistry>,
    kind: ObserverKind,
    id: u64,
}

impl ObserverHandle {
    fn new(registry: &Arc<ObserverRegistry>, kind: ObserverKind, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            kind,
            id,
        }
    }

    /// Unregister now.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
