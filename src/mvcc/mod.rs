//! MVCC Domain Types
//!
//! Defines the versioned-memory vocabulary shared by every snapshot:
//!
//! This module provides:
//! - `SnapshotId` - Totally ordered snapshot and record identity
//! - `SnapshotIdSet` - Immutable id set (invalid sets, open set)
//! - `VersionClock` - Monotonic id source
//! - `SnapshotRegistry` - Open snapshots, pins, and the low watermark
//! - `RecordChain` - Per-cell ring of versioned records
//! - `Visibility` - Deterministic record selection
//! - `GC` - Watermark-driven record reclamation
//!
//! Nothing in this module locks. Callers provide mutual exclusion.

mod clock;
mod gc;
mod id_set;
mod record;
mod registry;
mod snapshot_id;
mod visibility;

pub use clock::VersionClock;
pub use gc::{GcEligibility, ReclaimReport, RecordLifecycleState, RecordSweep};
pub use id_set::SnapshotIdSet;
pub use record::{BrokenRing, RecordChain, RecordRef, RecordSlot, RingWalk, StateRecord};
pub use registry::{PinHandle, SnapshotRegistry, Watermark};
pub use snapshot_id::SnapshotId;
pub use visibility::Visibility;
