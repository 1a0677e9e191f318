//! Per-snapshot observers
//!
//! Read and write callbacks attached to one snapshot when it is taken.
//! Children inherit them: a nested snapshot calls its own observer first,
//! then each ancestor's.

use std::fmt;
use std::sync::Arc;

use crate::state::CellId;

/// Called with the id of a cell read or written through a snapshot.
pub type CellObserver = Arc<dyn Fn(CellId) + Send + Sync>;

/// Observers attached to a snapshot.
#[derive(Clone, Default)]
pub struct SnapshotObservers {
    read: Option<CellObserver>,
    write: Option<CellObserver>,
}

impl SnapshotObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `observer` for every cell read through the snapshot.
    pub fn on_read<F>(mut self, observer: F) -> Self
    where
        F: Fn(CellId) + Send + Sync + 'static,
    {
        self.read = Some(Arc::new(observer));
        self
    }

    /// Call `observer` the first time the snapshot writes each cell.
    pub fn on_write<F>(mut self, observer: F) -> Self
    where
        F: Fn(CellId) + Send + Sync + 'static,
    {
        self.write = Some(Arc::new(observer));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    /// Observers of a child of a snapshot observed by `parent`.
    pub fn merged(&self, parent: &SnapshotObservers) -> Self {
        Self {
            read: merge(self.read.as_ref(), parent.read.as_ref()),
            write: merge(self.write.as_ref(), parent.write.as_ref()),
        }
    }

    pub fn notify_read(&self, cell: CellId) {
        if let Some(observer) = &self.read {
            observer(cell);
        }
    }

    pub fn notify_write(&self, cell: CellId) {
        if let Some(observer) = &self.write {
            observer(cell);
        }
    }
}

fn merge(own: Option<&CellObserver>, parent: Option<&CellObserver>) -> Option<CellObserver> {
    match (own, parent) {
        (Some(own), Some(parent)) => {
            let (own, parent) = (Arc::clone(own), Arc::clone(parent));
            Some(Arc::new(move |cell| {
                own(cell);
                parent(cell);
            }))
        }
        (Some(only), None) | (None, Some(only)) => Some(Arc::clone(only)),
        (None, None) => None,
    }
}

impl fmt::Debug for SnapshotObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotObservers")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .finish()
    }
}
