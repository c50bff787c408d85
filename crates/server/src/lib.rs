//! # fg-server
//!
//! REST entry point of flowgate: process control, trigger listing,
//! repository refresh and event ingress on top of [`fg_core::Orchestrator`].

pub mod error;
pub mod handlers;
pub mod router;

use std::sync::Arc;

use fg_core::Orchestrator;

pub use router::build_router;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}
