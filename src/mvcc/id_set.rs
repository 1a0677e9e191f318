//! SnapshotIdSet - Immutable set of snapshot ids
//!
//! Used for:
//! - A snapshot's invalid set (ids whose records it must ignore)
//! - The registry's open set
//! - A mutable snapshot's retired and absorbed ids
//!
//! Sets are copy-on-write: every mutating operation returns a new set and
//! leaves the receiver untouched, so a snapshot can hand its invalid set to
//! readers without holding a lock while they walk record rings.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use super::SnapshotId;

/// An immutable, cheaply clonable set of snapshot ids.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SnapshotIdSet {
    ids: Arc<BTreeSet<u64>>,
}

impl SnapshotIdSet {
    /// The empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if `id` is a member.
    #[inline]
    pub fn get(&self, id: SnapshotId) -> bool {
        self.ids.contains(&id.value())
    }

    /// Returns a set that also contains `id`.
    pub fn set(&self, id: SnapshotId) -> Self {
        if self.get(id) {
            return self.clone();
        }
        let mut ids = (*self.ids).clone();
        ids.insert(id.value());
        Self { ids: Arc::new(ids) }
    }

    /// Returns a set without `id`.
    pub fn clear(&self, id: SnapshotId) -> Self {
        if !self.get(id) {
            return self.clone();
        }
        let mut ids = (*self.ids).clone();
        ids.remove(&id.value());
        Self { ids: Arc::new(ids) }
    }

    /// Union of two sets.
    pub fn or(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut ids = (*self.ids).clone();
        ids.extend(other.ids.iter().copied());
        Self { ids: Arc::new(ids) }
    }

    /// Members of `self` that are not in `other`.
    pub fn and_not(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() || self.is_empty() {
            return self.clone();
        }
        let ids: BTreeSet<u64> = self.ids.difference(&other.ids).copied().collect();
        Self { ids: Arc::new(ids) }
    }

    /// Adds every id in `[from, until)`.
    pub fn add_range(&self, from: SnapshotId, until: SnapshotId) -> Self {
        if from >= until {
            return self.clone();
        }
        let mut ids = (*self.ids).clone();
        ids.extend(from.value()..until.value());
        Self { ids: Arc::new(ids) }
    }

    /// Lowest member, or `default` when the set is empty.
    pub fn lowest(&self, default: SnapshotId) -> SnapshotId {
        self.ids
            .iter()
            .next()
            .map(|v| SnapshotId::new(*v))
            .unwrap_or(default)
    }

    /// Number of members.
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the set has no members.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = SnapshotId> + '_ {
        self.ids.iter().map(|v| SnapshotId::new(*v))
    }
}

impl FromIterator<SnapshotId> for SnapshotIdSet {
    fn from_iter<I: IntoIterator<Item = SnapshotId>>(iter: I) -> Self {
        Self {
            ids: Arc::new(iter.into_iter().map(|id| id.value()).collect()),
        }
    }
}

impl fmt::Debug for SnapshotIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids.iter()).finish()
    }
}
