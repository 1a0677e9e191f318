//! Change notification
//!
//! This module provides:
//! - `ChangeSet` - The cells one publication changed
//! - `ObserverRegistry` - Apply and global write observers
//! - `SnapshotObservers` - Read and write observers bound to one snapshot
//! - `DeliveryQueue` - Publication-ordered delivery outside the runtime lock
//! - `DependencyTracker` - Per-scope read sets and precise invalidation

mod change_set;
mod delivery;
mod registry;
mod scoped;
mod tracker;

pub use change_set::{ChangeOrigin, ChangeSet};
pub use delivery::{DeliveryQueue, Ticket};
pub use registry::{ApplyObserver, GlobalWriteObserver, ObserverHandle, ObserverRegistry};
pub use scoped::{CellObserver, SnapshotObservers};
pub use tracker::DependencyTracker;
