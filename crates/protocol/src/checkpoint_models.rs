//! Checkpoint models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A named, ordered restore point of a process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: Uuid,
    pub process_id: Uuid,

    /// Name given by the flow. Not unique within a process.
    pub name: String,

    pub created_at: DateTime<Utc>,

    /// Position within the process's checkpoint log, starting at 0.
    pub sequence: u64,

    /// Opaque execution state captured at the checkpoint.
    pub snapshot: Value,
}

/// Checkpoint as listed over the API, without its snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
}

impl From<&Checkpoint> for CheckpointEntry {
    fn from(c: &Checkpoint) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            created_at: c.created_at,
            sequence: c.sequence,
        }
    }
}
