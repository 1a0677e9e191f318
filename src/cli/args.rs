//! CLI argument definitions using clap
//!
//! Commands:
//! - aerostate scenario [--config <path>]
//! - aerostate stress [--config <path>] [--threads N] [--iterations N]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerostate - multi-version snapshot state engine
#[derive(Parser, Debug)]
#[command(name = "aerostate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the reference isolation / conflict / nesting scenario
    Scenario {
        /// Optional runtime configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Apply concurrent increments from several threads and report metrics
    Stress {
        /// Optional runtime configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of writer threads
        #[arg(long, default_value_t = 4)]
        threads: usize,

        /// Increments applied by each thread
        #[arg(long, default_value_t = 1000)]
        iterations: usize,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
