//! Snapshot error types
//!
//! Error codes:
//! - AERO_SNAPSHOT_ILLEGAL_WRITE (ERROR severity)
//! - AERO_SNAPSHOT_ILLEGAL_STATE (ERROR severity)
//! - AERO_SNAPSHOT_APPLY_CONFLICT (WARN severity, retryable)
//! - AERO_SNAPSHOT_RECORD_CORRUPTION (FATAL severity)
//! - AERO_SNAPSHOT_LOCK_POISONED (FATAL severity)
//! - AERO_SNAPSHOT_CONFIG (ERROR severity)

use thiserror::Error;

use super::lifecycle::SnapshotState;
use crate::mvcc::SnapshotId;
use crate::observability::Severity;
use crate::state::CellId;

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshot errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    // ==================
    // Lifecycle Errors
    // ==================
    /// Write attempted through a read-only snapshot
    #[error("Cannot write through read-only snapshot {snapshot}")]
    IllegalWrite { snapshot: SnapshotId },

    /// Operation on a snapshot that is no longer open
    #[error("Cannot {operation} snapshot {snapshot}: snapshot is {state}")]
    IllegalStateUse {
        snapshot: SnapshotId,
        state: SnapshotState,
        operation: &'static str,
    },

    // ==================
    // Apply Errors
    // ==================
    /// A concurrent write could not be reconciled
    #[error("Apply of snapshot {snapshot} conflicts on {cell}{}", label.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default())]
    ApplyConflict {
        snapshot: SnapshotId,
        cell: CellId,
        label: Option<String>,
    },

    // ==================
    // Internal Errors
    // ==================
    /// No visible record for a live cell
    #[error("Record corruption in {cell} for snapshot {snapshot}: {detail}")]
    RecordCorruption {
        cell: CellId,
        snapshot: SnapshotId,
        detail: String,
    },

    /// A lock was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Invalid configuration or resource limit
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SnapshotError {
    /// Stable error code string
    pub fn code(&self) -> &'static str {
        match self {
            SnapshotError::IllegalWrite { .. } => "AERO_SNAPSHOT_ILLEGAL_WRITE",
            SnapshotError::IllegalStateUse { .. } => "AERO_SNAPSHOT_ILLEGAL_STATE",
            SnapshotError::ApplyConflict { .. } => "AERO_SNAPSHOT_APPLY_CONFLICT",
            SnapshotError::RecordCorruption { .. } => "AERO_SNAPSHOT_RECORD_CORRUPTION",
            SnapshotError::LockPoisoned(_) => "AERO_SNAPSHOT_LOCK_POISONED",
            SnapshotError::Config(_) => "AERO_SNAPSHOT_CONFIG",
        }
    }

    /// Severity the error is logged at
    pub fn severity(&self) -> Severity {
        match self {
            SnapshotError::ApplyConflict { .. } => Severity::Warn,
            SnapshotError::RecordCorruption { .. } | SnapshotError::LockPoisoned(_) => {
                Severity::Fatal
            }
            _ => Severity::Error,
        }
    }

    /// Returns true for invariant violations and lifecycle bugs
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SnapshotError::IllegalStateUse { .. }
                | SnapshotError::RecordCorruption { .. }
                | SnapshotError::LockPoisoned(_)
        )
    }

    /// Returns true if retrying the mutation in a fresh snapshot may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SnapshotError::ApplyConflict { .. })
    }

    /// The conflicting cell, for apply conflicts
    pub fn conflicting_cell(&self) -> Option<CellId> {
        match self {
            SnapshotError::ApplyConflict { cell, .. } => Some(*cell),
            _ => None,
        }
    }

    pub(crate) fn illegal_state(
        snapshot: SnapshotId,
        state: SnapshotState,
        operation: &'static str,
    ) -> Self {
        SnapshotError::IllegalStateUse {
            snapshot,
            state,
            operation,
        }
    }
}

/// Map a poisoned lock to `SnapshotError::LockPoisoned`.
pub(crate) fn poisoned<T>(what: &'static str) -> impl FnOnce(T) -> SnapshotError {
    move |_| SnapshotError::LockPoisoned(what)
}
