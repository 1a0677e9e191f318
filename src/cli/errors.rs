//! CLI error types
//!
//! Every failure carries a stable `AERO_CLI_*` code that ends up in the
//! JSON error envelope.

use std::io;

use thiserror::Error;

use crate::snapshot::SnapshotError;

/// CLI error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Config file missing, unreadable or invalid
    ConfigError,
    /// Writing the response failed
    IoError,
    /// Argument values the command cannot run with
    InvalidArgument,
    /// The engine returned an error the command did not expect
    EngineError,
    /// A run completed but broke an engine guarantee
    CheckFailed,
}

impl CliErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "AERO_CLI_CONFIG_ERROR",
            Self::IoError => "AERO_CLI_IO_ERROR",
            Self::InvalidArgument => "AERO_CLI_INVALID_ARGUMENT",
            Self::EngineError => "AERO_CLI_ENGINE_ERROR",
            Self::CheckFailed => "AERO_CLI_CHECK_FAILED",
        }
    }
}

/// A coded CLI failure
#[derive(Debug, Error)]
#[error("{}: {message}", .code.code())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidArgument, message)
    }

    pub fn check_failed(message: impl Into<String>) -> Self {
        Self::new(CliErrorCode::CheckFailed, message)
    }

    pub fn code(&self) -> CliErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::new(CliErrorCode::IoError, e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(CliErrorCode::IoError, format!("response encoding failed: {}", e))
    }
}

impl From<SnapshotError> for CliError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::Config(message) => Self::new(CliErrorCode::ConfigError, message),
            other => Self::new(
                CliErrorCode::EngineError,
                format!("{}: {}", other.code(), other),
            ),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;
