//! State Record Chain - Versioned value storage for one cell
//!
//! Each cell owns a ring of records. A record carries:
//! - The version that created it (a snapshot id or a publication version)
//! - The value, dropped once the record is reclaimed
//! - The arena index of the next record in the ring
//!
//! The ring lives in an arena (`Vec`) and links are indices, never pointers.
//! Invariants:
//! - The ring always holds at least one record
//! - Following `next` from `head` returns to `head` after exactly `len` steps
//! - A record stamped `SnapshotId::INVALID` is invisible to every snapshot and
//!   its slot may be reused by the next write
//!
//! Visibility decisions live in [`super::Visibility`]; this module only
//! stores, links, and walks records.

use super::SnapshotId;

/// Arena index of a record within its chain.
pub type RecordSlot = usize;

/// A single versioned value.
#[derive(Debug, Clone)]
pub struct StateRecord<V> {
    /// Version that created this record.
    snapshot_id: SnapshotId,
    /// Value, `None` once reclaimed.
    value: Option<V>,
    /// Next record in the ring.
    next: RecordSlot,
}

impl<V> StateRecord<V> {
    /// The creation version.
    #[inline]
    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    /// The value, if the record has not been reclaimed.
    #[inline]
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Returns true if no snapshot may observe this record.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        self.snapshot_id.is_invalid()
    }
}

/// Identity of a record: its slot plus the version it carried when observed.
///
/// Two observations of the same slot with different versions are different
/// records (the slot was reused in between).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    pub slot: RecordSlot,
    pub snapshot_id: SnapshotId,
}

/// Ring of records for a single cell.
#[derive(Debug, Clone)]
pub struct RecordChain<V> {
    records: Vec<StateRecord<V>>,
    head: RecordSlot,
}

/// Ring walk failed to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenRing {
    pub steps: usize,
    pub len: usize,
}

impl<V> RecordChain<V> {
    /// Create a ring holding a single record.
    pub fn new(value: V, snapshot_id: SnapshotId) -> Self {
        Self {
            records: vec![StateRecord {
                snapshot_id,
                value: Some(value),
                next: 0,
            }],
            head: 0,
        }
    }

    /// Number of slots in the arena (live, invalid, and reclaimed).
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// A ring is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The record at `slot`.
    #[inline]
    pub fn record(&self, slot: RecordSlot) -> &StateRecord<V> {
        &self.records[slot]
    }

    /// Identity of the record at `slot`.
    #[inline]
    pub fn record_ref(&self, slot: RecordSlot) -> RecordRef {
        RecordRef {
            slot,
            snapshot_id: self.records[slot].snapshot_id,
        }
    }

    /// Walk the ring once, starting at the head.
    pub fn walk(&self) -> RingWalk<'_, V> {
        RingWalk {
            chain: self,
            current: Some(self.head),
            steps: 0,
        }
    }

    /// Verify that the ring closes on itself after visiting every slot once.
    pub fn check_ring(&self) -> Result<(), BrokenRing> {
        let mut slot = self.head;
        for step in 0..self.records.len() {
            slot = self.records[slot].next;
            if slot == self.head {
                if step + 1 == self.records.len() {
                    return Ok(());
                }
                return Err(BrokenRing {
                    steps: step + 1,
                    len: self.records.len(),
                });
            }
        }
        Err(BrokenRing {
            steps: self.records.len(),
            len: self.records.len(),
        })
    }

    /// Link a new record into the ring, directly after the head.
    pub fn link(&mut self, value: V, snapshot_id: SnapshotId) -> RecordSlot {
        let slot = self.records.len();
        let after = self.records[self.head].next;
        self.records.push(StateRecord {
            snapshot_id,
            value: Some(value),
            next: after,
        });
        self.records[self.head].next = slot;
        slot
    }

    /// Overwrite the record at `slot` in place, restamping it.
    pub fn overwrite(&mut self, slot: RecordSlot, value: V, snapshot_id: SnapshotId) {
        let record = &mut self.records[slot];
        record.value = Some(value);
        record.snapshot_id = snapshot_id;
    }

    /// Replace only the value of the record at `slot`.
    pub fn set_value(&mut self, slot: RecordSlot, value: V) {
        self.records[slot].value = Some(value);
    }

    /// Mark the record at `slot` invisible and drop its value.
    pub fn invalidate(&mut self, slot: RecordSlot) {
        let record = &mut self.records[slot];
        record.snapshot_id = SnapshotId::INVALID;
        record.value = None;
    }
}

/// Iterator over `(slot, record)` pairs in ring order.
pub struct RingWalk<'a, V> {
    chain: &'a RecordChain<V>,
    current: Option<RecordSlot>,
    steps: usize,
}

impl<'a, V> Iterator for RingWalk<'a, V> {
    type Item = (RecordSlot, &'a StateRecord<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.current?;
        // Bounded by the arena size even if a link is corrupt.
        if self.steps >= self.chain.records.len() {
            self.current = None;
            return None;
        }
        self.steps += 1;
        let record = &self.chain.records[slot];
        self.current = if record.next == self.chain.head {
            None
        } else {
            Some(record.next)
        };
        Some((slot, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> SnapshotId {
        SnapshotId::new(v)
    }

    #[test]
    fn test_new_chain_is_single_record_ring() {
        let chain = RecordChain::new(7, SnapshotId::PREEXISTING);
        assert_eq!(chain.len(), 1);
        assert!(chain.check_ring().is_ok());

        let walked: Vec<_> = chain.walk().map(|(slot, r)| (slot, *r.value().unwrap())).collect();
        assert_eq!(walked, vec![(0, 7)]);
    }

    #[test]
    fn test_link_keeps_ring_closed() {
        let mut chain = RecordChain::new("a", id(1));
        chain.link("b", id(2));
        chain.link("c", id(3));

        assert_eq!(chain.len(), 3);
        assert!(chain.check_ring().is_ok());

        let mut values: Vec<_> = chain.walk().map(|(_, r)| *r.value().unwrap()).collect();
        values.sort();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_overwrite_restamps_in_place() {
        let mut chain = RecordChain::new(1, id(1));
        let slot = chain.link(2, id(5));
        chain.overwrite(slot, 3, id(9));

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.record(slot).snapshot_id(), id(9));
        assert_eq!(chain.record(slot).value(), Some(&3));
    }

    #[test]
    fn test_invalidate_drops_value() {
        let mut chain = RecordChain::new(String::from("x"), id(1));
        let slot = chain.link(String::from("y"), id(4));
        chain.invalidate(slot);

        assert!(chain.record(slot).is_invalid());
        assert!(chain.record(slot).value().is_none());
        assert!(chain.check_ring().is_ok());
    }

    #[test]
    fn test_record_ref_distinguishes_reuse() {
        let mut chain = RecordChain::new(0, id(1));
        let slot = chain.link(1, id(4));
        let before = chain.record_ref(slot);
        chain.overwrite(slot, 2, id(8));
        let after = chain.record_ref(slot);

        assert_eq!(before.slot, after.slot);
        assert_ne!(before, after);
    }

    #[test]
    fn test_broken_ring_is_detected() {
        let mut chain = RecordChain::new(0, id(1));
        chain.link(1, id(2));
        chain.link(2, id(3));
        // Short-circuit the ring: slot 2 points at itself.
        chain.records[2].next = 2;

        assert!(chain.check_ring().is_err());
        // The walk is still bounded.
        assert!(chain.walk().count() <= chain.len());
    }
}
