//! aerostate - multi-version snapshot state engine
//!
//! Observable cells, isolated snapshots over them, atomic apply with
//! conflict detection and merge policies, and read-set tracking for
//! recomputation.

pub mod cli;
pub mod mvcc;
pub mod observability;
pub mod observer;
pub mod snapshot;
pub mod state;

pub use observer::{ChangeOrigin, ChangeSet, DependencyTracker, ObserverHandle, SnapshotObservers};
pub use snapshot::{
    RuntimeConfig, Snapshot, SnapshotError, SnapshotKind, SnapshotResult, SnapshotRuntime,
    SnapshotState,
};
pub use state::{policy, CellId, MergePolicy, StateCell};
