//! Runtime Configuration
//!
//! Every field is optional in JSON; missing fields take the defaults below.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::errors::{SnapshotError, SnapshotResult};
use crate::observability::Severity;

/// Snapshot runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sweep dominated records after every root apply and global advance
    /// (default: true)
    #[serde(default = "default_reclaim_on_apply")]
    pub reclaim_on_apply: bool,

    /// Initial state of the read-observation toggle (default: true)
    #[serde(default = "default_observation_enabled")]
    pub observation_enabled: bool,

    /// Minimum severity written by the logger (default: WARN)
    #[serde(default = "default_log_level")]
    pub log_level: Severity,

    /// Upper bound on simultaneously open snapshot ids, the global snapshot
    /// included. 0 means unlimited (default: 0)
    #[serde(default)]
    pub max_open_snapshots: usize,
}

fn default_reclaim_on_apply() -> bool {
    true
}

fn default_observation_enabled() -> bool {
    true
}

fn default_log_level() -> Severity {
    Severity::Warn
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reclaim_on_apply: default_reclaim_on_apply(),
            observation_enabled: default_observation_enabled(),
            log_level: default_log_level(),
            max_open_snapshots: 0,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> SnapshotResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(content)
            .map_err(|e| SnapshotError::Config(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> SnapshotResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| SnapshotError::Config(format!("Failed to read config: {}", e)))?;
        Self::from_json_str(&content)
    }

    /// Validate field combinations
    pub fn validate(&self) -> SnapshotResult<()> {
        // The global snapshot always holds one id.
        if self.max_open_snapshots == 1 {
            return Err(SnapshotError::Config(
                "max_open_snapshots must be 0 (unlimited) or at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Limit the number of open snapshot ids
    pub fn with_max_open_snapshots(max: usize) -> Self {
        Self {
            max_open_snapshots: max,
            ..Default::default()
        }
    }

    /// Returns true if opening `opening` more ids would exceed the limit
    pub(crate) fn exceeds_open_limit(&self, open: usize, opening: usize) -> bool {
        self.max_open_snapshots > 0 && open + opening > self.max_open_snapshots
    }
}
