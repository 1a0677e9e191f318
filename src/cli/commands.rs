//! CLI command implementations
//!
//! Each command builds its own runtime from the optional config file,
//! runs to completion and reports one JSON object.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};

use crate::observability::ObservationScope;
use crate::snapshot::{RuntimeConfig, SnapshotError, SnapshotRuntime};
use crate::state::policy;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_error, write_response};

/// Main entry point for CLI
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command, reporting failures as a JSON error envelope
pub fn run_command(cmd: Command) -> CliResult<()> {
    let outcome = match cmd {
        Command::Scenario { config } => scenario(config.as_deref()),
        Command::Stress {
            config,
            threads,
            iterations,
        } => stress(config.as_deref(), threads, iterations),
    };

    match outcome {
        Ok(data) => write_response(data),
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            Err(e)
        }
    }
}

fn build_runtime(config_path: Option<&Path>) -> CliResult<SnapshotRuntime> {
    let config = match config_path {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    Ok(SnapshotRuntime::with_config(config)?)
}

/// Walk through isolation, conflict detection, merging and nesting on a
/// fresh runtime.
pub fn scenario(config_path: Option<&Path>) -> CliResult<Value> {
    let runtime = build_runtime(config_path)?;

    // Isolation
    let counter = runtime.create_labeled_cell("counter", 0i64, None);
    let writer = runtime.take_mutable_snapshot()?;
    writer.write(&counter, 1)?;
    let before = runtime.take_snapshot()?;
    let read_before = before.read(&counter)?;
    writer.apply()?;
    let after = runtime.take_snapshot()?;
    let read_after = after.read(&counter)?;
    let read_before_after_apply = before.read(&counter)?;
    before.dispose()?;
    after.dispose()?;

    // Conflict
    let first = runtime.take_mutable_snapshot()?;
    let second = runtime.take_mutable_snapshot()?;
    first.write(&counter, 10)?;
    second.write(&counter, 20)?;
    first.apply()?;
    let conflict = match second.apply() {
        Ok(()) => return Err(CliError::check_failed("second apply was not rejected")),
        Err(e) => e,
    };
    second.dispose()?;

    // Merge
    let total = runtime.create_labeled_cell("total", 10i64, Some(policy::add_deltas()));
    let left = runtime.take_mutable_snapshot()?;
    let right = runtime.take_mutable_snapshot()?;
    left.enter(|| total.update(|v| v + 3))?;
    right.enter(|| total.update(|v| v + 5))?;
    left.apply()?;
    right.apply()?;
    let merged = total.get()?;

    // Nesting
    let parent = runtime.take_mutable_snapshot()?;
    let child = parent.take_nested_mutable_snapshot()?;
    child.write(&counter, 42)?;
    child.apply()?;
    let parent_sees = parent.read(&counter)?;
    let global_before_parent_apply = counter.get()?;
    parent.apply()?;
    let global_after_parent_apply = counter.get()?;

    let report = runtime.reclaim()?;

    if read_before != 0 || read_after != 1 || read_before_after_apply != 0 {
        return Err(CliError::check_failed("snapshot isolation violated"));
    }
    if merged != 18 || parent_sees != 42 || global_after_parent_apply != 42 {
        return Err(CliError::check_failed("apply produced unexpected values"));
    }

    Ok(json!({
        "isolation": {
            "read_before_apply": read_before,
            "read_after_apply": read_after,
            "old_snapshot_after_apply": read_before_after_apply,
        },
        "conflict": {
            "code": conflict.code(),
            "retryable": conflict.is_retryable(),
            "message": conflict.to_string(),
        },
        "merge": {
            "policy": total.policy_name(),
            "value": merged,
        },
        "nested": {
            "parent_sees": parent_sees,
            "global_before_parent_apply": global_before_parent_apply,
            "global_after_parent_apply": global_after_parent_apply,
        },
        "reclaim": report,
        "metrics": runtime.metrics(),
    }))
}

/// Increment one shared counter from `threads` threads, retrying on
/// conflicts, and check that no increment was lost.
pub fn stress(config_path: Option<&Path>, threads: usize, iterations: usize) -> CliResult<Value> {
    if threads == 0 {
        return Err(CliError::invalid_argument("threads must be > 0"));
    }

    let runtime = build_runtime(config_path)?;
    let counter = Arc::new(runtime.create_labeled_cell("counter", 0u64, None));
    let scope = ObservationScope::with_fields(
        "CLI_STRESS",
        vec![
            ("threads", threads.to_string()),
            ("iterations", iterations.to_string()),
        ],
    );

    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let runtime = runtime.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || -> Result<u64, SnapshotError> {
                let mut retries = 0u64;
                for _ in 0..iterations {
                    loop {
                        let snapshot = runtime.take_mutable_snapshot()?;
                        snapshot.enter(|| counter.update(|v| v + 1))?;
                        match snapshot.apply() {
                            Ok(()) => break,
                            Err(e) if e.is_retryable() => {
                                snapshot.dispose()?;
                                retries += 1;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Ok(retries)
            })
        })
        .collect();

    let mut retries = 0u64;
    for worker in workers {
        let outcome = worker
            .join()
            .map_err(|_| CliError::check_failed("writer thread panicked"))?;
        retries += outcome?;
    }

    let expected = (threads * iterations) as u64;
    let observed = counter.get()?;
    if observed != expected {
        let message = format!("lost updates: expected {}, observed {}", expected, observed);
        scope.fail(&message);
        return Err(CliError::check_failed(message));
    }
    scope.complete_with_fields(&[("retries", &retries.to_string())]);

    let report = runtime.reclaim()?;

    Ok(json!({
        "threads": threads,
        "iterations": iterations,
        "final": observed,
        "retries": retries,
        "open_snapshots": runtime.open_snapshot_count()?,
        "live_records": counter.live_record_count(),
        "reclaim": report,
        "metrics": runtime.metrics(),
    }))
}
