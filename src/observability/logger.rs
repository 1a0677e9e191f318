//! Structured JSON logger
//!
//! Every line is one JSON object: `event`, then `severity`, then the
//! caller's fields ordered by key. Lines below the process-wide threshold
//! are dropped before any formatting happens; the threshold starts at
//! `Warn` so an idle engine stays silent.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Per-operation detail (snapshot open/dispose, global advances)
    Trace = 0,
    /// Applies, merges, reclamation passes
    Info = 1,
    /// Apply conflicts and scopes dropped without an outcome
    Warn = 2,
    /// Failed operations
    Error = 3,
    /// Record corruption and poisoned locks
    Fatal = 4,
}

const LEVELS: [Severity; 5] = [
    Severity::Trace,
    Severity::Info,
    Severity::Warn,
    Severity::Error,
    Severity::Fatal,
];

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Trace => "TRACE",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
        }
    }

    fn from_level(level: u8) -> Severity {
        LEVELS
            .get(level as usize)
            .copied()
            .unwrap_or(Severity::Fatal)
    }

    /// Error and Fatal lines go to stderr.
    fn to_stderr(self) -> bool {
        self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(Severity::Warn as u8);

/// Process-wide JSON-lines logger
pub struct Logger;

impl Logger {
    /// Set the lowest severity that is written.
    pub fn set_min_severity(severity: Severity) {
        THRESHOLD.store(severity as u8, Ordering::Relaxed);
    }

    pub fn min_severity() -> Severity {
        Severity::from_level(THRESHOLD.load(Ordering::Relaxed))
    }

    /// Returns true if a line at `severity` passes the threshold.
    pub fn enabled(severity: Severity) -> bool {
        severity >= Self::min_severity()
    }

    /// Write one event line if `severity` passes the threshold.
    pub fn log(severity: Severity, event: &str, fields: &[(&str, &str)]) {
        if !Self::enabled(severity) {
            return;
        }
        let line = Self::format_line(severity, event, fields);
        // A full pipe or closed stream must never fail an engine operation.
        let _ = if severity.to_stderr() {
            Self::emit(&mut io::stderr().lock(), &line)
        } else {
            Self::emit(&mut io::stdout().lock(), &line)
        };
    }

    fn emit<W: Write>(writer: &mut W, line: &str) -> io::Result<()> {
        writer.write_all(line.as_bytes())?;
        writer.flush()
    }

    /// Render one log line, trailing newline included.
    pub fn format_line(severity: Severity, event: &str, fields: &[(&str, &str)]) -> String {
        let mut ordered: Vec<&(&str, &str)> = fields.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        let mut line = String::with_capacity(64 + fields.len() * 24);
        line.push('{');
        Self::push_pair(&mut line, "event", event);
        line.push(',');
        Self::push_pair(&mut line, "severity", severity.as_str());
        for (key, value) in ordered {
            line.push(',');
            Self::push_pair(&mut line, key, value);
        }
        line.push_str("}\n");
        line
    }

    fn push_pair(line: &mut String, key: &str, value: &str) {
        Self::push_quoted(line, key);
        line.push(':');
        Self::push_quoted(line, value);
    }

    fn push_quoted(line: &mut String, s: &str) {
        match serde_json::to_string(s) {
            Ok(quoted) => line.push_str(&quoted),
            Err(_) => line.push_str("\"\""),
        }
    }
}
