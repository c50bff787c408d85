//! REST request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::process_models::{
    ExclusiveKey, ProcessArchive, ProcessInstance, ProcessKind, ProcessStatus,
};
use crate::repository_models::ExclusiveSpec;

/// Body of `POST /process`.
///
/// Either `archive` or an `org`/`project`/`repo` reference supplies the
/// process definition.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StartProcessRequest {
    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub entry_point: Option<String>,
    pub arguments: Map<String, Value>,
    pub archive: Option<ProcessArchive>,
    pub exclusive: Option<ExclusiveSpec>,
    pub requirements: Map<String, Value>,
    pub meta: Map<String, Value>,
    pub initiator: Option<String>,
    pub parent_instance_id: Option<Uuid>,
}

/// Response of `POST /process`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartProcessResponse {
    pub instance_id: Uuid,
    pub status: ProcessStatus,
}

/// Body of `POST /process/{id}/restore`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub checkpoint_id: Uuid,
}

/// Process as returned by `GET /process/{id}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEntry {
    pub instance_id: Uuid,
    pub parent_instance_id: Option<Uuid>,
    pub kind: ProcessKind,
    pub status: ProcessStatus,
    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
    pub initiator: String,
    pub entry_point: String,
    pub exclusive: Option<ExclusiveKey>,
    pub meta: Map<String, Value>,
    pub requirements: Map<String, Value>,
    pub children_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl From<&ProcessInstance> for ProcessEntry {
    fn from(p: &ProcessInstance) -> Self {
        Self {
            instance_id: p.id,
            parent_instance_id: p.parent_id,
            kind: p.kind,
            status: p.status,
            org: p.org.clone(),
            project: p.project.clone(),
            repo: p.repo.clone(),
            initiator: p.initiator.clone(),
            entry_point: p.entry_point.clone(),
            exclusive: p.exclusive.clone(),
            meta: p.meta.clone(),
            requirements: p.requirements.clone(),
            children_ids: p.children_ids.clone(),
            created_at: p.created_at,
            last_updated_at: p.last_updated_at,
        }
    }
}

/// Response of the event ingress endpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    /// Processes started from the event.
    pub instance_ids: Vec<Uuid>,
}

/// Response of `POST /repository/{name}/refresh`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub repository: String,
    pub triggers: usize,
}
