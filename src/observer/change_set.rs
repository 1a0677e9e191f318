//! Change sets handed to apply observers

use serde::Serialize;

use crate::mvcc::SnapshotId;
use crate::state::CellId;

/// Where a change set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A mutable snapshot applied into global state
    Applied,
    /// Writes made directly to the global snapshot, published by an advance
    GlobalWrites,
}

/// The cells changed by one publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    /// Snapshot whose writes were published
    pub snapshot_id: SnapshotId,
    /// Version under which the changes became visible
    pub version: SnapshotId,
    /// Changed cells in ascending id order
    pub cells: Vec<CellId>,
    pub origin: ChangeOrigin,
}

impl ChangeSet {
    pub fn new(
        snapshot_id: SnapshotId,
        version: SnapshotId,
        mut cells: Vec<CellId>,
        origin: ChangeOrigin,
    ) -> Self {
        cells.sort_unstable();
        cells.dedup();
        Self {
            snapshot_id,
            version,
            cells,
            origin,
        }
    }

    /// Returns true if `cell` changed
    pub fn contains(&self, cell: CellId) -> bool {
        self.cells.binary_search(&cell).is_ok()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
