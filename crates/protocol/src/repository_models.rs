//! Repository and process definition models.
//!
//! A repository checkout (or an uploaded archive) contains a `flowgate.yml`
//! file and optional `flowgate/*.yml` fragments. Their merged content is a
//! [`RepositoryDefinition`]: process configuration, opaque flows and triggers.
//!
//! Example `flowgate.yml`:
//!
//! ```yaml
//! configuration:
//!   entryPoint: main
//!   exclusive:
//!     group: RED
//!     mode: cancelOld
//! flows:
//!   main:
//!     - log: "Hello"
//! triggers:
//!   - github:
//!       conditions:
//!         type: push
//!       entryPoint: main
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::process_models::ExclusiveMode;

/// Exclusive group declaration, in process configuration or on a trigger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExclusiveSpec {
    /// Group name.
    pub group: String,

    /// Conflict policy.
    #[serde(default)]
    pub mode: ExclusiveMode,

    /// Partition the group by the event's branch.
    #[serde(default)]
    pub group_by_branch: bool,

    /// Partition the group by the value of an event attribute.
    #[serde(default)]
    pub group_by_event_attr: Option<String>,
}

/// What a trigger does with a push that changed no files.
///
/// Written as `ignore`, `fire` or `{ route: <entryPoint> }`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(try_from = "OnEmptyRepr", into = "OnEmptyRepr")]
pub enum OnEmpty {
    /// Do not start anything.
    #[default]
    Ignore,

    /// Start the trigger's regular entry point.
    Fire,

    /// Start the named entry point instead.
    Route(String),
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum OnEmptyRepr {
    Keyword(String),
    Route { route: String },
}

impl TryFrom<OnEmptyRepr> for OnEmpty {
    type Error = String;

    fn try_from(repr: OnEmptyRepr) -> Result<Self, Self::Error> {
        match repr {
            OnEmptyRepr::Keyword(k) if k == "ignore" => Ok(OnEmpty::Ignore),
            OnEmptyRepr::Keyword(k) if k == "fire" => Ok(OnEmpty::Fire),
            OnEmptyRepr::Keyword(k) => Err(format!(
                "unknown onEmpty value '{k}', expected 'ignore', 'fire' or {{ route: <entryPoint> }}"
            )),
            OnEmptyRepr::Route { route } => Ok(OnEmpty::Route(route)),
        }
    }
}

impl From<OnEmpty> for OnEmptyRepr {
    fn from(value: OnEmpty) -> Self {
        match value {
            OnEmpty::Ignore => OnEmptyRepr::Keyword("ignore".to_string()),
            OnEmpty::Fire => OnEmptyRepr::Keyword("fire".to_string()),
            OnEmpty::Route(route) => OnEmptyRepr::Route { route },
        }
    }
}

/// Trigger declaration as written in `flowgate.yml`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerBody {
    /// Attribute name to matcher declaration.
    pub conditions: Map<String, Value>,

    /// Flow to start; defaults to the repository's configured entry point.
    pub entry_point: Option<String>,

    pub arguments: Map<String, Value>,

    /// Overrides the configuration-level exclusive group.
    pub exclusive: Option<ExclusiveSpec>,

    pub on_empty: OnEmpty,

    /// Cron expression, `cron` triggers only.
    pub spec: Option<String>,
}

/// Process-level configuration of a repository definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessConfiguration {
    pub entry_point: Option<String>,
    pub arguments: Map<String, Value>,
    pub exclusive: Option<ExclusiveSpec>,
    pub requirements: Map<String, Value>,
    pub meta: Map<String, Value>,

    /// Execution budget in seconds.
    pub timeout: Option<u64>,

    /// Maximum time in SUSPENDED, in seconds.
    pub suspend_timeout: Option<u64>,

    /// Variables copied into process metadata on completion.
    pub out: Vec<String>,

    pub dependencies: Vec<String>,

    /// Additional resource directories, relative to the workspace root.
    pub resources: Vec<String>,
}

/// Merged content of `flowgate.yml` and its fragments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryDefinition {
    pub configuration: ProcessConfiguration,

    /// Flow name to opaque step list. Never interpreted by the core.
    pub flows: Map<String, Value>,

    /// Each entry is a single-key map: `- <eventSource>: {...}`.
    pub triggers: Vec<BTreeMap<String, TriggerBody>>,
}

impl RepositoryDefinition {
    /// Flattens the trigger list into `(event source, body)` pairs.
    pub fn trigger_entries(&self) -> Vec<(String, TriggerBody)> {
        self.triggers
            .iter()
            .flat_map(|entry| {
                entry
                    .iter()
                    .map(|(source, body)| (source.clone(), body.clone()))
            })
            .collect()
    }

    /// Merges a fragment into this definition.
    ///
    /// Flows and triggers are appended; configuration scalars from the
    /// fragment win when set.
    pub fn merge(&mut self, other: RepositoryDefinition) {
        let cfg = other.configuration;
        if cfg.entry_point.is_some() {
            self.configuration.entry_point = cfg.entry_point;
        }
        if cfg.exclusive.is_some() {
            self.configuration.exclusive = cfg.exclusive;
        }
        if cfg.timeout.is_some() {
            self.configuration.timeout = cfg.timeout;
        }
        if cfg.suspend_timeout.is_some() {
            self.configuration.suspend_timeout = cfg.suspend_timeout;
        }
        self.configuration.arguments.extend(cfg.arguments);
        self.configuration.requirements.extend(cfg.requirements);
        self.configuration.meta.extend(cfg.meta);
        self.configuration.out.extend(cfg.out);
        self.configuration.dependencies.extend(cfg.dependencies);
        self.configuration.resources.extend(cfg.resources);
        self.flows.extend(other.flows);
        self.triggers.extend(other.triggers);
    }
}

/// A registered repository of a project.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: Uuid,
    pub org: String,
    pub project: String,
    pub name: String,

    /// Clone URL, e.g. `https://github.com/acme/app.git`.
    pub url: String,

    /// Tracked branch; `None` means the configured default branch.
    pub branch: Option<String>,

    /// Subdirectory of the checkout holding `flowgate.yml`.
    pub path: Option<String>,

    /// Set when the tracked ref was deleted.
    pub disabled: bool,
}
