//! Worker adapter implementations.

pub mod command;
pub mod mock_worker;
pub mod scripted;

pub use command::CommandWorker;
pub use mock_worker::MockWorker;
pub use scripted::ScriptedWorker;
