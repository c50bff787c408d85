//! Configuration loading and management.
//!
//! This module provides functionality to load the server configuration
//! (`flowgate.toml`) and repository definitions (`flowgate.yml` plus
//! `flowgate/*.yml` fragments) from disk or from an uploaded archive.

pub mod error;
pub mod loader;
