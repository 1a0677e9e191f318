//! Observability subsystem
//!
//! This module provides:
//! - Structured logging (JSON lines, severity threshold)
//! - Per-runtime counters
//! - Typed lifecycle events
//!
//! # Principles
//!
//! 1. Observability is read-only
//! 2. No side effects on engine state
//! 3. No background threads
//! 4. Logging never fails an operation
//!
//! # Usage
//!
//! ```ignore
//! use aerostate::observability::{log_event, Event, ObservationScope};
//!
//! log_event(Event::SnapshotApply, &[("snapshot", "#4")]);
//!
//! let scope = ObservationScope::new("SNAPSHOT_APPLY");
//! // ... do work ...
//! scope.complete();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

/// Log a lifecycle event at its own severity
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
