//! Observable engine events
//!
//! Events are explicit and typed. Each event carries its default severity
//! so call sites never pick one ad hoc.

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Runtime lifecycle
    /// Runtime created
    RuntimeStart,

    // Snapshot lifecycle
    /// Snapshot opened
    SnapshotOpen,
    /// Snapshot applied
    SnapshotApply,
    /// Apply rejected by an unresolved conflict
    SnapshotApplyConflict,
    /// Conflict resolved by a merge policy
    SnapshotMerge,
    /// Snapshot disposed
    SnapshotDispose,

    // Global snapshot
    /// Global snapshot advanced
    GlobalAdvance,

    // Reclamation
    /// Records reclaimed by a sweep
    RecordsReclaimed,
    /// Ring walk found no visible record (FATAL)
    RecordCorruption,

    // Observers
    /// Observer registered
    ObserverRegistered,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::RuntimeStart => "RUNTIME_START",

            Event::SnapshotOpen => "SNAPSHOT_OPEN",
            Event::SnapshotApply => "SNAPSHOT_APPLY",
            Event::SnapshotApplyConflict => "SNAPSHOT_APPLY_CONFLICT",
            Event::SnapshotMerge => "SNAPSHOT_MERGE",
            Event::SnapshotDispose => "SNAPSHOT_DISPOSE",

            Event::GlobalAdvance => "GLOBAL_ADVANCE",

            Event::RecordsReclaimed => "RECORDS_RECLAIMED",
            Event::RecordCorruption => "RECORD_CORRUPTION",

            Event::ObserverRegistered => "OBSERVER_REGISTERED",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::RecordCorruption)
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::RecordCorruption => Severity::Fatal,
            Event::SnapshotApplyConflict => Severity::Warn,
            Event::RuntimeStart
            | Event::SnapshotApply
            | Event::SnapshotMerge
            | Event::RecordsReclaimed
            | Event::ObserverRegistered => Severity::Info,
            Event::SnapshotOpen | Event::SnapshotDispose | Event::GlobalAdvance => Severity::Trace,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
