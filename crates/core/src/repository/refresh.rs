//! Repository refresh.
//!
//! Fetching a repository is delegated to a [`RepositoryFetcher`]; the core
//! only reads the resulting checkout and replaces the repository's triggers.

use crate::config::loader::load_repository_definition;
use crate::error::{CoreError, CoreResult};
use crate::repository::{RepositoryKey, RepositoryRegistry};
use crate::triggers::registry::TriggerRegistry;
use async_trait::async_trait;
use fg_protocol::ipc::Event;
use fg_protocol::repository_models::{Repository, RepositoryDefinition};
use fg_protocol::trigger_models::Trigger;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Entry point used when neither the trigger nor the configuration names one.
pub const DEFAULT_ENTRY_POINT: &str = "default";

/// Produces a local checkout of a repository.
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Fetch (or update) the checkout and return its root directory.
    async fn fetch(&self, repository: &Repository) -> CoreResult<PathBuf>;
}

/// Fetcher for repositories already checked out on disk.
///
/// Uses the `path` configured for each repository in `flowgate.toml`.
pub struct LocalPathFetcher {
    registry: Arc<RepositoryRegistry>,
}

impl LocalPathFetcher {
    pub fn new(registry: Arc<RepositoryRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RepositoryFetcher for LocalPathFetcher {
    async fn fetch(&self, repository: &Repository) -> CoreResult<PathBuf> {
        let key = RepositoryKey::from(repository);
        self.registry
            .checkout(&key)
            .await
            .ok_or_else(|| CoreError::RepositoryNotFound(format!("{key} has no local checkout")))
    }
}

/// Re-reads repository definitions and swaps their triggers.
pub struct RepositoryRefresher {
    repositories: Arc<RepositoryRegistry>,
    triggers: Arc<TriggerRegistry>,
    fetcher: Arc<dyn RepositoryFetcher>,
    events_tx: broadcast::Sender<Event>,
}

impl RepositoryRefresher {
    pub fn new(
        repositories: Arc<RepositoryRegistry>,
        triggers: Arc<TriggerRegistry>,
        fetcher: Arc<dyn RepositoryFetcher>,
        events_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            repositories,
            triggers,
            fetcher,
            events_tx,
        }
    }

    /// Refresh every repository registered under `name`.
    ///
    /// # Returns
    ///
    /// The total number of triggers registered for those repositories.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryNotFound` if no repository has this name, or the
    /// first fetch, load or compile error. A repository that fails keeps its
    /// previous triggers.
    pub async fn refresh(&self, name: &str) -> CoreResult<usize> {
        let repositories = self.repositories.by_name(name).await;
        if repositories.is_empty() {
            return Err(CoreError::RepositoryNotFound(name.to_string()));
        }

        let mut total = 0;
        for repository in repositories {
            total += self.refresh_one(&repository).await?;
        }
        Ok(total)
    }

    /// Refresh a single repository.
    pub async fn refresh_one(&self, repository: &Repository) -> CoreResult<usize> {
        let key = RepositoryKey::from(repository);
        let mut root = self.fetcher.fetch(repository).await?;
        if let Some(sub) = repository.path.as_deref().filter(|p| !p.is_empty()) {
            root = root.join(sub);
        }

        let definition = load_repository_definition(&root).await?;
        let triggers = build_triggers(&key, &definition);
        let count = self.triggers.replace_repository(key.clone(), triggers).await?;
        self.repositories.set_definition(key.clone(), definition).await;

        tracing::info!(repository = %key, triggers = count, "Repository refreshed");
        let _ = self.events_tx.send(Event::TriggersReplaced {
            repository: key.to_string(),
            count,
        });
        Ok(count)
    }
}

/// Build the triggers declared by a repository definition.
pub fn build_triggers(key: &RepositoryKey, definition: &RepositoryDefinition) -> Vec<Trigger> {
    definition
        .trigger_entries()
        .into_iter()
        .map(|(source, body)| Trigger {
            id: Uuid::new_v4(),
            org: key.org.clone(),
            project: key.project.clone(),
            repo: key.name.clone(),
            event_source: source,
            conditions: body.conditions,
            entry_point: body
                .entry_point
                .or_else(|| definition.configuration.entry_point.clone())
                .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
            arguments: body.arguments,
            exclusive: body.exclusive,
            on_empty: body.on_empty,
            spec: body.spec,
        })
        .collect()
}
