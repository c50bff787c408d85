//! Process lifecycle management.
//!
//! - [`process`]: the state machine as pure functions
//! - [`manager`]: lifecycle operations over the shared stores

pub mod manager;
pub mod process;

pub use manager::{Dispatch, StateManager};
