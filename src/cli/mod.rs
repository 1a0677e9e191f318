//! CLI module for aerostate
//!
//! Provides command-line interface for:
//! - scenario: isolation, conflict, merge and nesting walk-through
//! - stress: concurrent increments with conflict retry

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command, scenario, stress};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{error_envelope, ok_envelope, write_error, write_response};
