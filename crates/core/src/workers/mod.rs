//! Worker layer: the execution side of the orchestrator.
//!
//! A [`Worker`] turns a [`Job`] into a stream of [`WorkerEvent`]s. The
//! [`WorkerPool`] selects workers by capability and concurrency slot.

pub mod adapters;
pub mod base;
pub mod pool;
pub mod retry;

pub use base::{Job, LockScope, Worker, WorkerError, WorkerEvent, WorkerStream};
pub use pool::{WorkerLease, WorkerPool};
pub use retry::{DependencyResolver, RetryPolicy, SchemeResolver};
