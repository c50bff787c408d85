//! Worker pool.
//!
//! The pool is responsible for:
//! - Registering workers with their capabilities and concurrency limit
//! - Selecting a worker whose capabilities satisfy a process's requirements
//! - Tracking busy slots through [`WorkerLease`]s

use crate::error::{CoreError, CoreResult};
use crate::triggers::matcher::Matcher;
use crate::workers::base::Worker;
use fg_protocol::config_models::WorkerConfig;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Slot {
    id: String,
    capabilities: Map<String, Value>,
    max_concurrency: usize,
    in_flight: Arc<AtomicUsize>,
    worker: Arc<dyn Worker>,
}

/// A reserved execution slot. The slot is freed when the lease is dropped.
pub struct WorkerLease {
    worker_id: String,
    worker: Arc<dyn Worker>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker(&self) -> Arc<dyn Worker> {
        Arc::clone(&self.worker)
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registered workers, in registration order.
#[derive(Default)]
pub struct WorkerPool {
    slots: Vec<Slot>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under its configuration.
    pub fn register(&mut self, config: &WorkerConfig, worker: Arc<dyn Worker>) {
        self.slots.push(Slot {
            id: config.id.clone(),
            capabilities: config.capabilities.clone(),
            max_concurrency: config.max_concurrency.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            worker,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns `true` if some registered worker could ever run a process
    /// with these requirements, busy or not.
    pub fn can_satisfy(&self, requirements: &Map<String, Value>) -> CoreResult<bool> {
        let matchers = compile_requirements(requirements)?;
        Ok(self
            .slots
            .iter()
            .any(|s| satisfies(&matchers, &s.capabilities)))
    }

    /// Reserve a free slot on the first worker satisfying `requirements`.
    ///
    /// Requirement values are matched against the worker's capabilities with
    /// the same rules as trigger conditions (strings are full-match regexes
    /// when regex-shaped).
    ///
    /// # Returns
    ///
    /// `None` if every matching worker is busy or none matches.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a requirement regex does not compile.
    pub fn acquire(&self, requirements: &Map<String, Value>) -> CoreResult<Option<WorkerLease>> {
        let matchers = compile_requirements(requirements)?;
        for slot in &self.slots {
            if !satisfies(&matchers, &slot.capabilities) {
                continue;
            }
            let reserved = slot
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < slot.max_concurrency).then_some(n + 1)
                })
                .is_ok();
            if reserved {
                return Ok(Some(WorkerLease {
                    worker_id: slot.id.clone(),
                    worker: Arc::clone(&slot.worker),
                    in_flight: Arc::clone(&slot.in_flight),
                }));
            }
        }
        Ok(None)
    }

    /// Busy slots of a worker.
    pub fn in_flight(&self, worker_id: &str) -> usize {
        self.slots
            .iter()
            .find(|s| s.id == worker_id)
            .map_or(0, |s| s.in_flight.load(Ordering::SeqCst))
    }
}

/// Compile process requirements.
///
/// # Errors
///
/// Returns `Validation` naming the requirement whose regex does not compile.
pub fn compile_requirements(requirements: &Map<String, Value>) -> CoreResult<Vec<(String, Matcher)>> {
    Matcher::compile_map(requirements).map_err(|e| match e {
        CoreError::Validation(msg) => CoreError::Validation(format!("requirements: {msg}")),
        other => other,
    })
}

fn satisfies(matchers: &[(String, Matcher)], capabilities: &Map<String, Value>) -> bool {
    matchers
        .iter()
        .all(|(key, matcher)| matcher.matches(capabilities.get(key)))
}
