//! Snapshot kinds and lifecycle states
//!
//! ```text
//!   take_* ──► Open ──apply()──► Applied ──dispose()──► Disposed
//!               │                                          ▲
//!               └──────────────dispose() / drop────────────┘
//! ```
//!
//! `Applied` and `Disposed` reject reads and writes.

use std::fmt;

use serde::Serialize;

/// What a snapshot may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Root read-only view
    ReadOnly,
    /// Root writable timeline, applies into global state
    Mutable,
    /// Read-only child of another snapshot
    NestedReadOnly,
    /// Writable child, applies into its parent
    NestedMutable,
}

impl SnapshotKind {
    /// Returns true if writes are rejected
    pub fn is_read_only(&self) -> bool {
        matches!(self, SnapshotKind::ReadOnly | SnapshotKind::NestedReadOnly)
    }

    /// Returns true if the snapshot has a parent
    pub fn is_nested(&self) -> bool {
        matches!(self, SnapshotKind::NestedReadOnly | SnapshotKind::NestedMutable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::ReadOnly => "read_only",
            SnapshotKind::Mutable => "mutable",
            SnapshotKind::NestedReadOnly => "nested_read_only",
            SnapshotKind::NestedMutable => "nested_mutable",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Open,
    Applied,
    Disposed,
}

impl SnapshotState {
    /// Returns true for `Applied` and `Disposed`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotState::Open => "open",
            SnapshotState::Applied => "applied",
            SnapshotState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
