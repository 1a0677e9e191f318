//! aerostate CLI entry point
//!
//! Parses arguments and dispatches through `cli::run`. The command has
//! already reported its JSON error envelope on stdout; the process only
//! sets the exit status.

use aerostate::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
