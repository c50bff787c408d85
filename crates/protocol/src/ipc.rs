//! Internal event notifications.
//!
//! The core broadcasts an [`Event`] for every observable change of a process
//! instance. Subscribers (the server's tracing bridge, tests) receive them
//! through a `tokio::sync::broadcast` channel.
//!
//! Uses tagged enum serialization:
//! ```json
//! {
//!   "type": "processStatusUpdate",
//!   "payload": {
//!     "process_id": "uuid-here",
//!     "status": "RUNNING"
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::process_models::{ProcessKind, ProcessStatus};

/// Events emitted by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Event {
    /// A new instance record was written.
    ProcessCreated {
        process_id: Uuid,
        kind: ProcessKind,
        parent_id: Option<Uuid>,
    },

    /// An instance changed status.
    ProcessStatusUpdate {
        process_id: Uuid,
        status: ProcessStatus,
    },

    /// An instance produced a log line.
    ProcessLogChunk { process_id: Uuid, content: String },

    /// An instance finished successfully.
    ProcessCompleted { process_id: Uuid },

    /// An instance failed.
    ProcessError { process_id: Uuid, error: String },

    /// An instance was cancelled.
    ProcessKilled { process_id: Uuid },

    /// A suspended instance was resumed.
    ProcessResumed { process_id: Uuid },

    /// A checkpoint was recorded.
    CheckpointCreated {
        process_id: Uuid,
        checkpoint_id: Uuid,
        name: String,
    },

    /// A repository's triggers were replaced.
    TriggersReplaced { repository: String, count: usize },
}
