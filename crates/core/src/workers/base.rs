//! Base Worker trait and supporting types.

use async_trait::async_trait;
use fg_protocol::process_models::{AwaitedCondition, ProcessInstance, ResumePayload};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;
use uuid::Uuid;

/// Everything a worker needs to execute (or continue) a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub process_id: Uuid,

    /// Flow to execute.
    pub entry_point: String,

    pub arguments: Map<String, Value>,

    /// Opaque flow definition.
    pub definition: Option<Value>,

    /// Cursor to continue from; `None` starts at the beginning.
    pub snapshot: Option<Value>,

    /// Payload that resumed the process, if any.
    pub resume_payload: Option<ResumePayload>,
}

impl From<&ProcessInstance> for Job {
    fn from(process: &ProcessInstance) -> Self {
        Self {
            process_id: process.id,
            entry_point: process.entry_point.clone(),
            arguments: process.arguments.clone(),
            definition: process.definition.clone(),
            snapshot: process.snapshot.clone(),
            resume_payload: process.resume_payload.clone(),
        }
    }
}

/// Namespace of a named lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum LockScope {
    Org,
    #[default]
    Project,
}

/// Events emitted by a worker while executing a job.
///
/// `Suspend`, `Finished` and `Failed` end the execution; a worker must not
/// emit anything after them. After `AcquireLock` the worker keeps going only
/// if the lock was granted; otherwise its stream is dropped and the process
/// continues later from the event's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    Log { line: String },
    Meta { key: String, value: Value },
    Checkpoint { name: String, snapshot: Value },
    Suspend { condition: AwaitedCondition, snapshot: Value },
    AcquireLock {
        #[serde(default)]
        scope: LockScope,
        key: String,
        snapshot: Value,
    },
    ReleaseLock {
        #[serde(default)]
        scope: LockScope,
        key: String,
    },
    Finished {
        #[serde(default)]
        out: Map<String, Value>,
    },
    Failed { error: String },
}

impl WorkerEvent {
    pub fn log(line: impl Into<String>) -> Self {
        WorkerEvent::Log { line: line.into() }
    }

    /// Returns `true` for events that end an execution.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Suspend { .. } | WorkerEvent::Finished { .. } | WorkerEvent::Failed { .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Worker not available: {0}")]
    Unavailable(String),
    #[error("Dependency resolution failed: {0}")]
    Dependency(String),
    #[error("Stream parsing error: {0}")]
    StreamParse(String),
    #[error("Execution failed: {0}")]
    Execution(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl WorkerError {
    /// Errors worth retrying with the same job.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkerError::Unavailable(_) | WorkerError::Dependency(_) | WorkerError::Timeout(_)
        )
    }
}

/// Stream of events produced by one execution.
pub type WorkerStream = Pin<Box<dyn Stream<Item = Result<WorkerEvent, WorkerError>> + Send>>;

#[async_trait]
pub trait Worker: Send + Sync {
    async fn check_availability(&self) -> bool;
    async fn execute(&self, job: &Job) -> Result<WorkerStream, WorkerError>;
}
