//! Common test utilities and helpers for integration tests.
//!
//! This module provides shared functionality across all integration tests including:
//! - Test fixtures (server configs, repository checkouts, start specs)
//! - Custom assertions
//! - Helper functions to drive the dispatcher

pub mod assertions;
pub mod fixtures;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
