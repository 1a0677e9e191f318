//! SnapshotId - Totally ordered version identity
//!
//! Every snapshot and every published record is stamped with a value taken
//! from the version clock. Identities are:
//! - Strictly increasing in allocation order
//! - Never reused within a runtime
//! - Independent of wall-clock time
//!
//! Two values are reserved:
//! - `INVALID` (0) marks a record no snapshot may observe (abandoned or reclaimed)
//! - `PREEXISTING` (1) stamps the initial record of every cell, visible to all snapshots

use std::fmt;

use serde::{Deserialize, Serialize};

/// A totally ordered, opaque snapshot identity.
///
/// Snapshot ids double as record creation versions: a record written by a
/// snapshot carries that snapshot's id until it is published under a fresh
/// version at apply time.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SnapshotId(u64);

impl SnapshotId {
    /// Reserved id that no snapshot considers valid.
    pub const INVALID: SnapshotId = SnapshotId(0);

    /// Reserved id carried by the initial record of every cell.
    pub const PREEXISTING: SnapshotId = SnapshotId(1);

    /// First id handed out by a fresh version clock.
    pub const FIRST: SnapshotId = SnapshotId(2);

    /// Creates a SnapshotId with the given value.
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying value.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns true for the reserved invalid id.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// The id immediately after this one.
    #[inline]
    pub(crate) fn successor(&self) -> SnapshotId {
        SnapshotId(self.0 + 1)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
