//! Runtime process state models.
//!
//! This module defines the structures for tracking a single process instance
//! from creation to a terminal state, together with the start specification
//! that produces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::repository_models::ExclusiveSpec;

/// Lifecycle status of a process instance.
///
/// Normal execution progresses through:
/// New -> Preparing -> Enqueued -> Starting -> Running -> Finished
///
/// Special states:
/// - Suspended: waiting for a form, an external event, a lock or an exclusive group
/// - Resuming: transient, re-enters Running on the next dispatch
/// - Finished, Failed, Cancelled, TimedOut: terminal
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    /// Record written, admission not attempted yet.
    New,

    /// Admission gates (policy, exclusive group) are being evaluated.
    Preparing,

    /// Admitted and waiting for the dispatcher.
    Enqueued,

    /// Handed to a worker, waiting for the first event.
    Starting,

    /// A worker is actively executing the process.
    Running,

    /// Execution is parked on an awaited condition.
    Suspended,

    /// Awaited condition satisfied, waiting for re-dispatch.
    Resuming,

    /// Completed successfully.
    Finished,

    /// Completed with an error.
    Failed,

    /// Cancelled by a user or by exclusive group arbitration.
    Cancelled,

    /// The execution budget elapsed.
    TimedOut,
}

impl ProcessStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ProcessStatus; 11] = [
        ProcessStatus::New,
        ProcessStatus::Preparing,
        ProcessStatus::Enqueued,
        ProcessStatus::Starting,
        ProcessStatus::Running,
        ProcessStatus::Suspended,
        ProcessStatus::Resuming,
        ProcessStatus::Finished,
        ProcessStatus::Failed,
        ProcessStatus::Cancelled,
        ProcessStatus::TimedOut,
    ];

    /// Returns `true` for the four states an instance never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Finished
                | ProcessStatus::Failed
                | ProcessStatus::Cancelled
                | ProcessStatus::TimedOut
        )
    }

    /// Returns `true` if the state graph has an edge from `self` to `next`.
    ///
    /// The checkpoint-restore edge out of terminal states is not part of this
    /// table; see [`ProcessStatus::is_restorable`].
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        match self {
            New => matches!(next, Preparing | Cancelled),
            Preparing => matches!(next, Enqueued | Failed | Cancelled),
            Enqueued => matches!(next, Starting | Cancelled),
            Starting => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Suspended | Finished | Failed | Cancelled | TimedOut),
            Suspended => matches!(next, Resuming | Cancelled | TimedOut),
            Resuming => matches!(next, Running | Failed | Cancelled),
            Finished | Failed | Cancelled | TimedOut => false,
        }
    }

    /// Returns `true` if a checkpoint restore is allowed from this status.
    pub fn is_restorable(self) -> bool {
        self.is_terminal() || self == ProcessStatus::Suspended
    }

    /// Returns the wire name of the status (e.g. `TIMED_OUT`).
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::New => "NEW",
            ProcessStatus::Preparing => "PREPARING",
            ProcessStatus::Enqueued => "ENQUEUED",
            ProcessStatus::Starting => "STARTING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Suspended => "SUSPENDED",
            ProcessStatus::Resuming => "RESUMING",
            ProcessStatus::Finished => "FINISHED",
            ProcessStatus::Failed => "FAILED",
            ProcessStatus::Cancelled => "CANCELLED",
            ProcessStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a process instance exists.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessKind {
    /// Started by a user, a trigger or a fork.
    #[default]
    Default,

    /// Spawned after the parent failed.
    FailureHandler,

    /// Spawned after the parent was cancelled.
    CancelHandler,

    /// Spawned after the parent timed out.
    TimeoutHandler,
}

impl ProcessKind {
    /// Handler instances never spawn handlers of their own.
    pub fn is_handler(self) -> bool {
        !matches!(self, ProcessKind::Default)
    }
}

/// The condition a suspended (or gated) instance is waiting for.
///
/// Persisted with the instance so that resumption is a pure function of
/// the stored state and the incoming payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AwaitedCondition {
    /// A form submission with the given id.
    Form {
        #[serde(rename = "formId")]
        form_id: String,
    },

    /// An external event with the given name.
    Event { name: String },

    /// A named lock held by another process (`waiting-on-lock`).
    Lock { scope: String, key: String },

    /// An exclusive group occupied by a running process.
    ExclusiveGroup { scope: String, group: String },
}

impl AwaitedCondition {
    /// Short reason string recorded in logs.
    pub fn reason(&self) -> String {
        match self {
            AwaitedCondition::Form { form_id } => format!("waiting-on-form '{form_id}'"),
            AwaitedCondition::Event { name } => format!("waiting-on-event '{name}'"),
            AwaitedCondition::Lock { scope, key } => format!("waiting-on-lock '{scope}/{key}'"),
            AwaitedCondition::ExclusiveGroup { group, .. } => {
                format!("waiting-on-exclusive-group '{group}'")
            }
        }
    }

    /// Conditions that only the core itself may satisfy.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            AwaitedCondition::Lock { .. } | AwaitedCondition::ExclusiveGroup { .. }
        )
    }
}

/// A named lock held by an instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct HeldLock {
    pub scope: String,
    pub key: String,
}

/// Payload submitted to resume a suspended instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    /// Form id or event name being answered.
    pub event: String,

    /// Submitted values, made available to the resumed execution.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Resolved exclusive group of an instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ExclusiveKey {
    /// `org/project`, optionally followed by a partition (branch, attribute).
    pub scope: String,

    /// Group name.
    pub group: String,

    /// Conflict policy.
    #[serde(default)]
    pub mode: ExclusiveMode,
}

/// What happens when an exclusive group is already occupied.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExclusiveMode {
    /// Cancel the incoming process.
    Cancel,

    /// Cancel the older, not yet running claim (last writer wins).
    #[default]
    CancelOld,

    /// Queue behind the holder without cancelling anything.
    Wait,
}

/// Entry points to start when the instance ends badly.
///
/// Each field names a flow in the instance's definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandlers {
    pub on_failure: Option<String>,
    pub on_cancel: Option<String>,
    pub on_timeout: Option<String>,
}

/// One entry of an instance's status history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub status: ProcessStatus,
    pub at: DateTime<Utc>,
}

/// A single file of an uploaded process archive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the archive root.
    pub path: String,

    /// File content.
    pub content: String,
}

/// A process archive: the workspace a process is started from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessArchive {
    pub entries: Vec<ArchiveEntry>,
}

impl ProcessArchive {
    /// Total size of all entries in bytes.
    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.content.len()).sum()
    }
}

/// Everything needed to create a process instance.
///
/// Produced by the REST start endpoint, by the trigger matcher, by the cron
/// scheduler and by handler spawning.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub initiator: String,
    pub parent_id: Option<Uuid>,
    pub kind: ProcessKind,
    pub entry_point: Option<String>,
    pub arguments: Map<String, Value>,
    pub exclusive: Option<ExclusiveSpec>,
    pub requirements: Map<String, Value>,
    pub handlers: ProcessHandlers,
    pub timeout_secs: Option<u64>,
    pub suspend_timeout_secs: Option<u64>,
    pub out_variables: Vec<String>,
    pub dependencies: Vec<String>,
    pub resources: Vec<String>,
    pub meta: Map<String, Value>,
    pub definition: Option<Value>,
    pub archive: Option<ProcessArchive>,

    /// Values available to exclusive group partitioning (`branch`, event attributes).
    pub event_attributes: Map<String, Value>,

    /// Creation watermark shared by all processes started from one event.
    pub created_at: Option<DateTime<Utc>>,
}

/// A single line of process output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub line: String,
}

/// Runtime state of a single process instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    /// Unique identifier, immutable.
    pub id: Uuid,

    /// Current lifecycle status.
    pub status: ProcessStatus,

    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,

    /// Identity that started the process.
    pub initiator: String,

    /// Parent instance for forks and handlers.
    pub parent_id: Option<Uuid>,

    pub kind: ProcessKind,

    /// Flow name to execute.
    pub entry_point: String,

    pub arguments: Map<String, Value>,

    /// Resolved exclusive group, if any.
    pub exclusive: Option<ExclusiveKey>,

    /// Ordered, mutable metadata.
    pub meta: Map<String, Value>,

    /// Worker capability requirements.
    pub requirements: Map<String, Value>,

    pub handlers: ProcessHandlers,

    /// Wall-clock execution budget, measured from the first RUNNING.
    pub timeout_secs: Option<u64>,

    /// Maximum time the instance may stay SUSPENDED.
    pub suspend_timeout_secs: Option<u64>,

    /// Names of output variables copied into `meta` on completion.
    pub out_variables: Vec<String>,

    /// External dependencies resolved before execution.
    pub dependencies: Vec<String>,

    /// Condition the instance is parked on, if any.
    pub awaiting: Option<AwaitedCondition>,

    /// Named locks currently held.
    #[serde(default)]
    pub held_locks: Vec<HeldLock>,

    /// Worker currently (or last) executing the instance.
    pub worker_id: Option<String>,

    /// Opaque execution cursor used to continue after suspend or restore.
    pub snapshot: Option<Value>,

    /// Payload of the last successful resume.
    pub resume_payload: Option<ResumePayload>,

    /// Opaque flow definition interpreted by workers.
    pub definition: Option<Value>,

    pub children_ids: Vec<Uuid>,
    pub status_history: Vec<StatusChange>,
    pub logs: Vec<LogEntry>,

    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub running_since: Option<DateTime<Utc>>,

    /// Insertion order, breaks `created_at` ties.
    pub seq: u64,
}

impl ProcessInstance {
    /// Returns `true` once the instance has reached RUNNING at least once.
    pub fn has_started(&self) -> bool {
        self.status_history
            .iter()
            .any(|c| c.status == ProcessStatus::Running)
    }

    /// Time the instance entered its current status.
    pub fn status_since(&self) -> DateTime<Utc> {
        self.status_history
            .last()
            .map(|c| c.at)
            .unwrap_or(self.last_updated_at)
    }

    /// Log lines without timestamps.
    pub fn log_lines(&self) -> Vec<String> {
        self.logs.iter().map(|e| e.line.clone()).collect()
    }
}
