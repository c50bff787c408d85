//! Repository registry.

use crate::repository::RepositoryKey;
use crate::store::snapshot::StoredDefinition;
use fg_protocol::config_models::RepositoryConfig;
use fg_protocol::repository_models::{Repository, RepositoryDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    repositories: Vec<Repository>,
    definitions: HashMap<RepositoryKey, RepositoryDefinition>,
    checkouts: HashMap<RepositoryKey, PathBuf>,
}

/// Repositories known to the core.
///
/// An event whose repository URL matches no enabled entry here is an
/// "unknown repository" event.
pub struct RepositoryRegistry {
    default_branch: String,
    inner: RwLock<Inner>,
}

impl RepositoryRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    ///
    /// * `default_branch` - Branch assumed for repositories without one
    pub fn new(default_branch: impl Into<String>) -> Self {
        Self {
            default_branch: default_branch.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Register (or update) a repository from configuration.
    ///
    /// An existing entry with the same key keeps its id and disabled flag.
    pub async fn register(&self, config: &RepositoryConfig) -> Repository {
        let key = RepositoryKey::new(&config.org, &config.project, &config.name);
        let mut inner = self.inner.write().await;

        if let Some(path) = &config.path {
            inner.checkouts.insert(key.clone(), path.clone());
        }

        if let Some(existing) = inner
            .repositories
            .iter_mut()
            .find(|r| RepositoryKey::from(&**r) == key)
        {
            existing.url = config.url.clone();
            existing.branch = config.branch.clone();
            return existing.clone();
        }

        let repository = Repository {
            id: Uuid::new_v4(),
            org: config.org.clone(),
            project: config.project.clone(),
            name: config.name.clone(),
            url: config.url.clone(),
            branch: config.branch.clone(),
            path: None,
            disabled: false,
        };
        inner.repositories.push(repository.clone());
        repository
    }

    pub async fn get(&self, key: &RepositoryKey) -> Option<Repository> {
        self.inner
            .read()
            .await
            .repositories
            .iter()
            .find(|r| RepositoryKey::from(*r) == *key)
            .cloned()
    }

    /// Repositories with the given name, in any organization or project.
    pub async fn by_name(&self, name: &str) -> Vec<Repository> {
        self.inner
            .read()
            .await
            .repositories
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    pub async fn list(&self) -> Vec<Repository> {
        self.inner.read().await.repositories.clone()
    }

    /// The configured branch, or the default branch.
    pub fn effective_branch(&self, repository: &Repository) -> String {
        repository
            .branch
            .clone()
            .unwrap_or_else(|| self.default_branch.clone())
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Enabled repositories matching an event's repository and branch.
    ///
    /// # Arguments
    ///
    /// * `full_name` - `owner/name` of the event's repository
    /// * `branch` - Event branch; `None` matches any branch
    pub async fn find_for_event(&self, full_name: &str, branch: Option<&str>) -> Vec<Repository> {
        self.inner
            .read()
            .await
            .repositories
            .iter()
            .filter(|r| !r.disabled && url_matches(&r.url, full_name))
            .filter(|r| branch.map_or(true, |b| self.effective_branch(r) == b))
            .cloned()
            .collect()
    }

    /// Disable every enabled repository tracking a deleted ref.
    ///
    /// # Returns
    ///
    /// Keys of the repositories that were disabled by this call.
    pub async fn disable_for_deleted_ref(&self, full_name: &str, branch: &str) -> Vec<RepositoryKey> {
        let mut inner = self.inner.write().await;
        let mut disabled = Vec::new();
        for repo in inner.repositories.iter_mut() {
            let tracked = repo
                .branch
                .clone()
                .unwrap_or_else(|| self.default_branch.clone());
            if !repo.disabled && url_matches(&repo.url, full_name) && tracked == branch {
                repo.disabled = true;
                disabled.push(RepositoryKey::from(&*repo));
            }
        }
        disabled
    }

    /// Store the definition read by the last refresh.
    pub async fn set_definition(&self, key: RepositoryKey, definition: RepositoryDefinition) {
        self.inner.write().await.definitions.insert(key, definition);
    }

    pub async fn definition(&self, key: &RepositoryKey) -> Option<RepositoryDefinition> {
        self.inner.read().await.definitions.get(key).cloned()
    }

    /// Local checkout configured for a repository.
    pub async fn checkout(&self, key: &RepositoryKey) -> Option<PathBuf> {
        self.inner.read().await.checkouts.get(key).cloned()
    }

    /// Definitions in snapshot form.
    pub async fn stored_definitions(&self) -> Vec<StoredDefinition> {
        let inner = self.inner.read().await;
        let mut stored: Vec<StoredDefinition> = inner
            .definitions
            .iter()
            .map(|(key, definition)| StoredDefinition {
                org: key.org.clone(),
                project: key.project.clone(),
                repo: key.name.clone(),
                definition: definition.clone(),
            })
            .collect();
        stored.sort_by(|a, b| (&a.org, &a.project, &a.repo).cmp(&(&b.org, &b.project, &b.repo)));
        stored
    }

    /// Merge persisted state into the registry.
    ///
    /// Persisted repositories keep their ids and disabled flags; entries that
    /// are no longer configured are kept as well so that their triggers and
    /// processes stay resolvable.
    pub async fn restore(&self, repositories: Vec<Repository>, definitions: Vec<StoredDefinition>) {
        let mut inner = self.inner.write().await;
        for persisted in repositories {
            let key = RepositoryKey::from(&persisted);
            match inner
                .repositories
                .iter_mut()
                .find(|r| RepositoryKey::from(&**r) == key)
            {
                Some(current) => {
                    current.id = persisted.id;
                    current.disabled = persisted.disabled;
                }
                None => inner.repositories.push(persisted),
            }
        }
        for stored in definitions {
            inner.definitions.insert(
                RepositoryKey::new(stored.org, stored.project, stored.repo),
                stored.definition,
            );
        }
    }
}

/// Returns `true` if `url` denotes the repository `owner/name`.
///
/// Accepts HTTPS and SSH forms with or without a `.git` suffix or a trailing
/// slash. Comparison is case-insensitive.
pub fn url_matches(url: &str, full_name: &str) -> bool {
    let url = url.trim().trim_end_matches('/').to_lowercase();
    let url = url.strip_suffix(".git").unwrap_or(url.as_str());
    let full_name = full_name.trim_matches('/').to_lowercase();
    if full_name.is_empty() {
        return false;
    }
    url == full_name
        || url.ends_with(&format!("/{full_name}"))
        || url.ends_with(&format!(":{full_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(project: &str, name: &str, url: &str, branch: Option<&str>) -> RepositoryConfig {
        RepositoryConfig {
            org: "Default".to_string(),
            project: project.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            branch: branch.map(str::to_string),
            path: None,
        }
    }

    #[test]
    fn test_url_matches() {
        assert!(url_matches("https://github.com/acme/app.git", "acme/app"));
        assert!(url_matches("https://github.com/Acme/App/", "acme/app"));
        assert!(url_matches("git@github.com:acme/app.git", "acme/app"));
        assert!(!url_matches("https://github.com/acme/app-two.git", "acme/app"));
        assert!(!url_matches("https://github.com/other-acme/app.git", "acme/app"));
        assert!(!url_matches("https://github.com/acme/app.git", ""));
    }

    #[tokio::test]
    async fn test_register_keeps_id_on_update() {
        let registry = RepositoryRegistry::new("master");
        let first = registry
            .register(&config("p", "r", "https://github.com/acme/r.git", None))
            .await;
        let second = registry
            .register(&config("p", "r", "https://github.com/acme/r2.git", Some("dev")))
            .await;

        assert_eq!(first.id, second.id);
        assert_eq!(second.branch.as_deref(), Some("dev"));
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_find_for_event_uses_default_branch() {
        let registry = RepositoryRegistry::new("master");
        registry
            .register(&config("a", "app", "https://github.com/acme/app.git", None))
            .await;
        registry
            .register(&config("b", "app", "https://github.com/acme/app.git", Some("dev")))
            .await;

        let on_master = registry.find_for_event("acme/app", Some("master")).await;
        assert_eq!(on_master.len(), 1);
        assert_eq!(on_master[0].project, "a");

        let on_dev = registry.find_for_event("acme/app", Some("dev")).await;
        assert_eq!(on_dev.len(), 1);
        assert_eq!(on_dev[0].project, "b");

        assert_eq!(registry.find_for_event("acme/app", None).await.len(), 2);
        assert!(registry.find_for_event("acme/other", Some("master")).await.is_empty());
    }

    #[tokio::test]
    async fn test_disable_for_deleted_ref() {
        let registry = RepositoryRegistry::new("master");
        registry
            .register(&config("a", "app", "https://github.com/acme/app.git", Some("feature")))
            .await;
        registry
            .register(&config("b", "app", "https://github.com/acme/app.git", None))
            .await;

        let disabled = registry.disable_for_deleted_ref("acme/app", "feature").await;
        assert_eq!(disabled, vec![RepositoryKey::new("Default", "a", "app")]);

        // Disabled repositories are unknown from now on
        assert!(registry.find_for_event("acme/app", Some("feature")).await.is_empty());
        // A second delete is a no-op
        assert!(registry.disable_for_deleted_ref("acme/app", "feature").await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_keeps_disabled_flag() {
        let registry = RepositoryRegistry::new("master");
        let mut persisted = registry
            .register(&config("a", "app", "https://github.com/acme/app.git", None))
            .await;
        persisted.disabled = true;

        let fresh = RepositoryRegistry::new("master");
        fresh
            .register(&config("a", "app", "https://github.com/acme/app.git", None))
            .await;
        fresh.restore(vec![persisted.clone()], Vec::new()).await;

        let key = RepositoryKey::from(&persisted);
        let restored = fresh.get(&key).await.unwrap();
        assert!(restored.disabled);
        assert_eq!(restored.id, persisted.id);
    }
}
