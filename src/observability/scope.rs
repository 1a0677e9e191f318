//! ObservationScope for bracketed operation logging
//!
//! - Logs `{name}_BEGIN` on creation (TRACE)
//! - Logs `{name}_COMPLETE` with the elapsed time on `complete()` (INFO)
//! - Logs `{name}_FAILED` on `fail()` (WARN) or `fail_fatal()` (FATAL)
//! - Logs `{name}_INCOMPLETE` if dropped without an outcome (WARN)

use std::time::Instant;

use super::logger::{Logger, Severity};

/// A scope that logs the begin and outcome of one operation
pub struct ObservationScope {
    name: &'static str,
    completed: bool,
    fields: Vec<(&'static str, String)>,
    timer: Timer,
}

impl ObservationScope {
    /// Open a scope with identifying fields, repeated on every outcome line.
    pub fn with_fields(name: &'static str, fields: Vec<(&'static str, String)>) -> Self {
        let scope = Self {
            name,
            completed: false,
            fields,
            timer: Timer::new(),
        };
        Logger::log(Severity::Trace, &format!("{}_BEGIN", name), &scope.field_refs());
        scope
    }

    /// Open a scope without fields.
    pub fn new(name: &'static str) -> Self {
        Self::with_fields(name, Vec::new())
    }

    fn field_refs(&self) -> Vec<(&str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    /// Mark the scope as successfully completed.
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    /// Mark the scope as completed with extra outcome fields.
    pub fn complete_with_fields(mut self, extra_fields: &[(&str, &str)]) {
        self.completed = true;
        let elapsed = self.timer.elapsed_us();
        let mut fields = self.field_refs();
        fields.push(("elapsed_us", &elapsed));
        fields.extend(extra_fields.iter().copied());
        Logger::log(Severity::Info, &format!("{}_COMPLETE", self.name), &fields);
    }

    /// Mark the scope as failed with a recoverable reason.
    pub fn fail(mut self, reason: &str) {
        self.completed = true;
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::log(Severity::Warn, &format!("{}_FAILED", self.name), &fields);
    }

    /// Mark the scope as failed by an invariant violation.
    pub fn fail_fatal(mut self, reason: &str) {
        self.completed = true;
        let mut fields = self.field_refs();
        fields.push(("reason", reason));
        Logger::log(Severity::Fatal, &format!("{}_FAILED", self.name), &fields);
    }

    /// Check if the scope has an outcome
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.completed {
            let mut fields = self.field_refs();
            fields.push(("reason", "scope dropped without completion"));
            Logger::log(Severity::Warn, &format!("{}_INCOMPLETE", self.name), &fields);
        }
    }
}

/// A simple duration timer
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed microseconds as a string
    pub fn elapsed_us(&self) -> String {
        self.start.elapsed().as_micros().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
