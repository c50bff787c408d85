//! Trigger registry models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::repository_models::{ExclusiveSpec, OnEmpty};

/// A registered trigger, owned by exactly one repository.
///
/// Triggers are immutable: refreshing a repository replaces all of its
/// triggers at once rather than editing them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: Uuid,

    /// Owning organization.
    pub org: String,

    /// Owning project.
    pub project: String,

    /// Owning repository name.
    pub repo: String,

    /// Event source, e.g. `github`, `cron`, `manual` or an external event name.
    pub event_source: String,

    /// Attribute name to matcher declaration, as written.
    pub conditions: Map<String, Value>,

    /// Flow to start when the trigger fires.
    pub entry_point: String,

    pub arguments: Map<String, Value>,

    /// Overrides the repository's configured exclusive group.
    pub exclusive: Option<ExclusiveSpec>,

    pub on_empty: OnEmpty,

    /// Cron expression for `cron` triggers.
    pub spec: Option<String>,
}

/// Filter for listing triggers.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerQuery {
    pub org: Option<String>,
    pub project: Option<String>,
    pub repo: Option<String>,
}

impl TriggerQuery {
    /// Returns `true` if `trigger` satisfies every set filter field.
    pub fn accepts(&self, trigger: &Trigger) -> bool {
        self.org.as_deref().map_or(true, |o| o == trigger.org)
            && self.project.as_deref().map_or(true, |p| p == trigger.project)
            && self.repo.as_deref().map_or(true, |r| r == trigger.repo)
    }
}
