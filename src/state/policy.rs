//! Merge policies
//!
//! A policy reconciles a cell written by an applying snapshot with a value
//! another snapshot published concurrently:
//!
//! ```text
//! merge(previous, applied, current) -> Option<V>
//!   previous  value the applying snapshot started from
//!   applied   value the applying snapshot wrote
//!   current   value published since
//! ```
//!
//! `None` rejects the apply with `ApplyConflict`.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;

type MergeFn<V> = dyn Fn(&V, &V, &V) -> Option<V> + Send + Sync;

/// A named, shareable merge function.
pub struct MergePolicy<V> {
    name: &'static str,
    merge: Arc<MergeFn<V>>,
}

impl<V> MergePolicy<V> {
    pub fn new<F>(name: &'static str, merge: F) -> Self
    where
        F: Fn(&V, &V, &V) -> Option<V> + Send + Sync + 'static,
    {
        Self {
            name,
            merge: Arc::new(merge),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reconcile `applied` with `current`, both derived from `previous`.
    pub fn merge(&self, previous: &V, applied: &V, current: &V) -> Option<V> {
        (self.merge)(previous, applied, current)
    }
}

impl<V> Clone for MergePolicy<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            merge: Arc::clone(&self.merge),
        }
    }
}

impl<V> fmt::Debug for MergePolicy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergePolicy").field("name", &self.name).finish()
    }
}

/// Accept the write when both sides wrote equal values.
pub fn structural_equality<V>() -> MergePolicy<V>
where
    V: PartialEq + Clone,
{
    MergePolicy::new("structural_equality", |_previous: &V, applied: &V, current: &V| {
        (applied == current).then(|| applied.clone())
    })
}

/// Numeric counters: publish `current + (applied - previous)`.
pub fn add_deltas<V>() -> MergePolicy<V>
where
    V: Add<Output = V> + Sub<Output = V> + Clone,
{
    MergePolicy::new("add_deltas", |previous: &V, applied: &V, current: &V| {
        Some(current.clone() + applied.clone() - previous.clone())
    })
}

/// The applying snapshot always wins.
pub fn last_writer_wins<V: Clone>() -> MergePolicy<V> {
    MergePolicy::new("last_writer_wins", |_previous: &V, applied: &V, _current: &V| {
        Some(applied.clone())
    })
}
