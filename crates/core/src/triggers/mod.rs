//! Triggers: registry, condition matching and event sources.
//!
//! This module provides:
//! - [`matcher`]: compiled condition matchers
//! - [`registry`]: triggers grouped by owning repository
//! - [`processor`]: matches inbound events to triggers and builds start specs
//! - [`github`]: webhook signature verification and payload parsing
//! - [`cron`]: time-based triggers

pub mod cron;
pub mod github;
pub mod matcher;
pub mod processor;
pub mod registry;

pub use cron::CronScheduler;
pub use matcher::{CompiledConditions, Matcher};
pub use processor::{TriggerMatch, TriggerMatcher};
pub use registry::TriggerRegistry;
