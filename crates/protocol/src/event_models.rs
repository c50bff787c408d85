//! Inbound event models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// An event offered to the trigger matcher.
///
/// Produced from webhook payloads, generic external events and cron ticks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Event source, compared with a trigger's `eventSource`.
    pub source: String,

    /// Full repository name (`owner/name`) for repository events.
    pub repository: Option<String>,

    /// Branch name, already stripped of `refs/heads/`.
    pub branch: Option<String>,

    /// Identity that caused the event.
    pub author: Option<String>,

    /// Arbitrary key-value payload.
    pub attributes: Map<String, Value>,

    /// Query parameters supplied with the HTTP call.
    pub query_params: BTreeMap<String, String>,

    /// A push that changed no files.
    pub empty: bool,

    /// A push that deleted its ref.
    pub deleted_ref: bool,

    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Create an event with no repository context.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            repository: None,
            branch: None,
            author: None,
            attributes: Map::new(),
            query_params: BTreeMap::new(),
            empty: false,
            deleted_ref: false,
            received_at: Utc::now(),
        }
    }

    /// Set the repository and branch.
    pub fn with_repository(mut self, full_name: impl Into<String>, branch: impl Into<String>) -> Self {
        self.repository = Some(full_name.into());
        self.branch = Some(branch.into());
        self
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Add a query parameter.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Mark the event as an empty push.
    pub fn with_empty(mut self, empty: bool) -> Self {
        self.empty = empty;
        self
    }
}
