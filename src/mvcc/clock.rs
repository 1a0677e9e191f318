//! Version Clock - Runtime-wide monotonic version counter
//!
//! The clock is the sole source of snapshot ids and publication versions:
//! - Every snapshot is stamped with a clock value when it opens
//! - Every successful apply stamps a fresh publication version
//! - Values are strictly increasing and never reused
//!
//! The clock holds no lock of its own. It lives inside the runtime's
//! critical section, which is what makes `next_version` atomic across threads.

use super::SnapshotId;

/// Monotonic version counter.
#[derive(Debug)]
pub struct VersionClock {
    /// The next value to hand out.
    next: u64,
}

impl VersionClock {
    /// Create a clock whose first issued value is `SnapshotId::FIRST`.
    pub fn new() -> Self {
        Self {
            next: SnapshotId::FIRST.value(),
        }
    }

    /// Issue the next version and advance the clock.
    pub fn next_version(&mut self) -> SnapshotId {
        let id = SnapshotId::new(self.next);
        self.next += 1;
        id
    }

    /// The value the next call to `next_version` will return.
    ///
    /// Every record published so far carries a version strictly lower than
    /// this, which makes it the upper bound for "latest committed" reads.
    pub fn peek(&self) -> SnapshotId {
        SnapshotId::new(self.next)
    }

    /// The highest version issued so far, if any.
    pub fn highest_issued(&self) -> Option<SnapshotId> {
        if self.next == SnapshotId::FIRST.value() {
            None
        } else {
            Some(SnapshotId::new(self.next - 1))
        }
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}
