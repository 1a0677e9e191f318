//! Observable state
//!
//! This module provides:
//! - `StateCell<V>` - Handle to one versioned, observable value
//! - `CellId` - Process-unique cell identity
//! - `MergePolicy<V>` and the stock policies in `policy`
//!
//! Cells are created through `SnapshotRuntime::create_cell` and friends.

mod cell;
pub mod policy;

pub use cell::{CellId, StateCell};
pub use policy::MergePolicy;

pub(crate) use cell::{ApplyView, RecordWrite, StagedValue, StateObject};
