//! Durable records of process instances.
//!
//! This module provides:
//! - [`ProcessStore`]: the owner of every `ProcessInstance`
//! - [`snapshot`]: JSON snapshots of the whole core state on disk

pub mod processes;
pub mod snapshot;

pub use processes::ProcessStore;
