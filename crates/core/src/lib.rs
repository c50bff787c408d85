//! # fg-core
//!
//! Orchestration core of flowgate.
//!
//! This crate provides:
//! - Admission of process instances, from explicit requests and from events
//! - Exclusive groups and named locks between competing instances
//! - Checkpoints and rewind of process instances
//! - Dispatch of runnable instances to workers
//!
//! ## Modules
//!
//! - [`config`]: Server configuration and repository definitions
//! - [`store`]: Process store and state snapshots
//! - [`state`]: Process state machine and lifecycle operations
//! - [`triggers`]: Trigger registry, matching and event sources
//! - [`repository`]: Registered repositories and refresh
//! - [`exclusive`]: Exclusive group arbiter
//! - [`locks`]: Named process locks
//! - [`checkpoint`]: Checkpoint store
//! - [`policy`]: Admission policy
//! - [`workers`]: Worker trait, pool and adapters
//! - [`engine`]: Queue dispatcher
//! - [`orchestrator`]: The assembled core

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod exclusive;
pub mod locks;
pub mod orchestrator;
pub mod policy;
pub mod repository;
pub mod state;
pub mod store;
pub mod triggers;
pub mod workers;

pub use error::{CoreError, CoreResult};
pub use orchestrator::Orchestrator;
