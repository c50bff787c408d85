//! Error types of the orchestration core.
//!
//! Errors fall into two groups. Admission-time errors (validation, policy,
//! missing definitions) are raised before any worker is involved. Execution-time
//! errors are recorded against the affected instance and never escape the
//! dispatcher.

use fg_protocol::process_models::ProcessStatus;
use thiserror::Error;
use uuid::Uuid;

use crate::config::error::ConfigError;
use crate::workers::base::WorkerError;

/// Errors returned by core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed start specification, disallowed path or bad regex.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A policy rule rejected the process.
    #[error("Admission denied by rule '{rule}': {reason}")]
    AdmissionDenied { rule: String, reason: String },

    /// The instance is not waiting for the submitted payload.
    #[error("Process {id} is not resumable: {reason}")]
    NotResumable { id: Uuid, reason: String },

    /// The checkpoint does not exist or belongs to another instance.
    #[error("Checkpoint {0} not found")]
    CheckpointNotFound(Uuid),

    /// A checkpoint restore was requested from a non-restorable status.
    #[error("Unable to restore a checkpoint, the process is {0}")]
    RestoreNotAllowed(ProcessStatus),

    #[error("Process {0} not found")]
    ProcessNotFound(Uuid),

    /// The state graph has no such edge.
    #[error("Invalid transition of process {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: ProcessStatus,
        to: ProcessStatus,
    },

    /// Webhook signature missing, malformed or not matching.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Repository {0} not found")]
    RepositoryNotFound(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Reading or writing the state snapshot failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Type alias for Result with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
