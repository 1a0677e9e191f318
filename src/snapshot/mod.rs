//! Snapshot subsystem for aerostate
//!
//! A snapshot is an isolated timeline over every cell of a runtime.
//!
//! # Kinds
//!
//! - Read-only: a frozen view of the state published when it opened
//! - Mutable: private writes, published atomically by `apply()`
//! - Nested: children of an open snapshot; a nested mutable snapshot
//!   applies into its parent, never directly into global state
//!
//! # Design Principles
//!
//! - Readers never block writers of other snapshots
//! - Apply is all-or-nothing
//! - Conflicts are reported, never dropped
//! - Lifecycle misuse is an error value, not a panic
//!
//! # Usage
//!
//! ```ignore
//! let runtime = SnapshotRuntime::new();
//! let counter = runtime.create_cell(0);
//!
//! let snapshot = runtime.take_mutable_snapshot()?;
//! snapshot.enter(|| counter.set(1))?;
//! snapshot.apply()?;
//! ```

mod apply;
mod config;
pub(crate) mod context;
mod errors;
mod handle;
mod lifecycle;
mod runtime;

pub use config::RuntimeConfig;
pub use errors::{SnapshotError, SnapshotResult};
pub use handle::Snapshot;
pub use lifecycle::{SnapshotKind, SnapshotState};
pub use runtime::{RuntimeId, SnapshotRuntime};

pub(crate) use errors::poisoned;
