//! # fg-protocol
//!
//! Shared data models for flowgate.
//!
//! This crate defines all data structures exchanged between the orchestration
//! core, the REST server and persisted state:
//! - Server configuration (`flowgate.toml`)
//! - Repository definitions (`flowgate.yml`) and triggers
//! - Runtime process state, checkpoints and inbound events
//! - REST request/response bodies and internal notifications
//!
//! ## Modules
//!
//! - [`api_models`]: REST request and response bodies
//! - [`checkpoint_models`]: Named restore points
//! - [`config_models`]: Server configuration from `flowgate.toml`
//! - [`event_models`]: Events offered to the trigger matcher
//! - [`process_models`]: Process status, instance and start specification
//! - [`repository_models`]: Repositories and their definitions
//! - [`trigger_models`]: Trigger registry entries
//! - [`ipc`]: Notifications broadcast by the core
//!
//! ## Design Principles
//!
//! - Minimal dependencies: only serde, uuid and chrono
//! - Independent compilation: no dependencies on other flowgate crates

pub mod api_models;
pub mod checkpoint_models;
pub mod config_models;
pub mod event_models;
pub mod ipc;
pub mod process_models;
pub mod repository_models;
pub mod trigger_models;

// Re-export all public types for convenience
pub use api_models::*;
pub use checkpoint_models::*;
pub use config_models::*;
pub use event_models::*;
pub use ipc::*;
pub use process_models::*;
pub use repository_models::*;
pub use trigger_models::*;
