//! Event to trigger matching.
//!
//! An inbound event is evaluated once per candidate repository context:
//! every enabled repository tracking the event's repository and branch, or a
//! single "unknown repository" context when there is none. A trigger fires at
//! most once per event, whatever the number of contexts it matches.

use crate::error::CoreResult;
use crate::repository::{RepositoryKey, RepositoryRegistry};
use crate::triggers::matcher::QUERY_PARAMS;
use crate::triggers::registry::{CompiledTrigger, TriggerRegistry};
use fg_protocol::event_models::InboundEvent;
use fg_protocol::process_models::ProcessSpec;
use fg_protocol::repository_models::{OnEmpty, Repository};
use fg_protocol::trigger_models::Trigger;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Placeholder for org, project and repository of unknown-repository events.
pub const UNKNOWN: &str = "n/a";

/// A trigger that fired, with the start specification it produced.
#[derive(Debug, Clone)]
pub struct TriggerMatch {
    pub trigger: Trigger,
    pub spec: ProcessSpec,
}

/// Repository context an event is evaluated in.
enum Context {
    /// Event without repository information (external events).
    Detached,

    /// A registered repository tracking the event's repository and branch.
    Known(Repository),

    /// The event's repository is not registered (or disabled).
    Unknown,
}

/// Matches inbound events against the trigger registry.
pub struct TriggerMatcher {
    triggers: Arc<TriggerRegistry>,
    repositories: Arc<RepositoryRegistry>,
    disable_repos_on_deleted_ref: bool,
}

impl TriggerMatcher {
    pub fn new(
        triggers: Arc<TriggerRegistry>,
        repositories: Arc<RepositoryRegistry>,
        disable_repos_on_deleted_ref: bool,
    ) -> Self {
        Self {
            triggers,
            repositories,
            disable_repos_on_deleted_ref,
        }
    }

    /// Match an event against all triggers of its source.
    ///
    /// # Returns
    ///
    /// One [`TriggerMatch`] per fired trigger, in registry order. All specs
    /// share the event's `received_at` as creation watermark.
    pub async fn match_event(&self, event: &InboundEvent) -> CoreResult<Vec<TriggerMatch>> {
        if event.deleted_ref && self.disable_repos_on_deleted_ref {
            self.disable_deleted_ref(event).await;
        }

        let contexts = self.contexts(event).await;
        let candidates = self.triggers.by_source(&event.source).await;

        let mut fired = HashSet::new();
        let mut matches = Vec::new();
        for candidate in candidates {
            if fired.contains(&candidate.trigger.id) {
                continue;
            }
            for context in &contexts {
                let attributes = attributes_for(event, context);
                if !self.accepts(candidate.as_ref(), event, context, &attributes).await {
                    continue;
                }
                fired.insert(candidate.trigger.id);
                let Some(entry_point) = entry_point_for(&candidate.trigger, event) else {
                    tracing::debug!(
                        trigger_id = %candidate.trigger.id,
                        "Skipping empty push"
                    );
                    break;
                };
                matches.push(TriggerMatch {
                    trigger: candidate.trigger.clone(),
                    spec: spec_for(&candidate.trigger, event, entry_point, attributes),
                });
                break;
            }
        }

        tracing::info!(
            source = %event.source,
            repository = event.repository.as_deref().unwrap_or(UNKNOWN),
            matched = matches.len(),
            "Event matched"
        );
        Ok(matches)
    }

    async fn disable_deleted_ref(&self, event: &InboundEvent) {
        let (Some(full_name), Some(branch)) = (&event.repository, &event.branch) else {
            return;
        };
        for key in self.repositories.disable_for_deleted_ref(full_name, branch).await {
            let dropped = self.triggers.remove_repository(&key).await;
            tracing::info!(repository = %key, branch = %branch, dropped, "Repository disabled, ref deleted");
        }
    }

    async fn contexts(&self, event: &InboundEvent) -> Vec<Context> {
        let Some(full_name) = &event.repository else {
            return vec![Context::Detached];
        };
        let known = self
            .repositories
            .find_for_event(full_name, event.branch.as_deref())
            .await;
        if known.is_empty() {
            vec![Context::Unknown]
        } else {
            known.into_iter().map(Context::Known).collect()
        }
    }

    /// Declared conditions plus the implicit repository defaults.
    async fn accepts(
        &self,
        candidate: &CompiledTrigger,
        event: &InboundEvent,
        context: &Context,
        attributes: &Map<String, Value>,
    ) -> bool {
        let conditions = &candidate.conditions;
        if !conditions.matches(attributes) {
            return false;
        }
        if matches!(context, Context::Detached) {
            return true;
        }

        let scoped = ["org", "project", "repository"]
            .iter()
            .any(|k| conditions.declares(k));
        if !scoped {
            match context {
                Context::Known(repo) if RepositoryKey::from(repo) == candidate.owner() => {}
                _ => return false,
            }
        }

        if !conditions.declares("unknownRepo") && matches!(context, Context::Unknown) {
            return false;
        }

        if !conditions.declares("branch") {
            let tracked = match self.repositories.get(&candidate.owner()).await {
                Some(owner) => self.repositories.effective_branch(&owner),
                None => self.repositories.default_branch().to_string(),
            };
            if event.branch.as_deref() != Some(tracked.as_str()) {
                return false;
            }
        }

        true
    }
}

fn attributes_for(event: &InboundEvent, context: &Context) -> Map<String, Value> {
    let mut attributes = event.attributes.clone();
    if let Some(branch) = &event.branch {
        attributes.insert("branch".to_string(), json!(branch));
    }
    if let Some(author) = &event.author {
        attributes.insert("author".to_string(), json!(author));
    }
    attributes.insert(QUERY_PARAMS.to_string(), json!(event.query_params));

    let (org, project, repository, unknown) = match context {
        Context::Detached => return attributes,
        Context::Known(repo) => (repo.org.as_str(), repo.project.as_str(), repo.name.as_str(), false),
        Context::Unknown => (UNKNOWN, UNKNOWN, UNKNOWN, true),
    };
    attributes.insert("org".to_string(), json!(org));
    attributes.insert("project".to_string(), json!(project));
    attributes.insert("repository".to_string(), json!(repository));
    attributes.insert("unknownRepo".to_string(), json!(unknown));
    attributes
}

/// Entry point to start, or `None` if the trigger ignores this event.
fn entry_point_for(trigger: &Trigger, event: &InboundEvent) -> Option<String> {
    if !event.empty {
        return Some(trigger.entry_point.clone());
    }
    match &trigger.on_empty {
        OnEmpty::Ignore => None,
        OnEmpty::Fire => Some(trigger.entry_point.clone()),
        OnEmpty::Route(entry_point) => Some(entry_point.clone()),
    }
}

fn spec_for(
    trigger: &Trigger,
    event: &InboundEvent,
    entry_point: String,
    attributes: Map<String, Value>,
) -> ProcessSpec {
    let mut arguments = trigger.arguments.clone();
    arguments.insert("event".to_string(), Value::Object(attributes.clone()));

    ProcessSpec {
        org: Some(trigger.org.clone()),
        project: Some(trigger.project.clone()),
        repo: Some(trigger.repo.clone()),
        initiator: event.author.clone().unwrap_or_else(|| event.source.clone()),
        entry_point: Some(entry_point),
        arguments,
        exclusive: trigger.exclusive.clone(),
        event_attributes: attributes,
        created_at: Some(event.received_at),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_protocol::config_models::RepositoryConfig;
    use uuid::Uuid;

    fn trigger(project: &str, repo: &str, conditions: Value) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            org: "Default".to_string(),
            project: project.to_string(),
            repo: repo.to_string(),
            event_source: "github".to_string(),
            conditions: conditions.as_object().cloned().unwrap_or_default(),
            entry_point: "onPush".to_string(),
            arguments: Map::new(),
            exclusive: None,
            on_empty: OnEmpty::Ignore,
            spec: None,
        }
    }

    async fn setup(repos: &[(&str, &str, &str, Option<&str>)]) -> (Arc<TriggerRegistry>, TriggerMatcher) {
        let repositories = Arc::new(RepositoryRegistry::new("master"));
        for (project, name, url, branch) in repos {
            repositories
                .register(&RepositoryConfig {
                    org: "Default".to_string(),
                    project: project.to_string(),
                    name: name.to_string(),
                    url: url.to_string(),
                    branch: branch.map(str::to_string),
                    path: None,
                })
                .await;
        }
        let triggers = Arc::new(TriggerRegistry::new());
        let matcher = TriggerMatcher::new(triggers.clone(), repositories, true);
        (triggers, matcher)
    }

    async fn install(triggers: &TriggerRegistry, list: Vec<Trigger>) {
        for t in list {
            let key = RepositoryKey::new(t.org.clone(), t.project.clone(), t.repo.clone());
            let mut existing: Vec<Trigger> = triggers
                .all()
                .await
                .into_iter()
                .filter(|e| e.project == t.project && e.repo == t.repo)
                .collect();
            existing.push(t);
            triggers.replace_repository(key, existing).await.unwrap();
        }
    }

    fn push(full_name: &str, branch: &str) -> InboundEvent {
        InboundEvent::new("github")
            .with_repository(full_name, branch)
            .with_author("alice")
            .with_attribute("type", json!("push"))
    }

    #[tokio::test]
    async fn test_default_trigger_matches_own_repository_only() {
        let (triggers, matcher) = setup(&[
            ("a", "app", "https://github.com/acme/app.git", None),
            ("b", "lib", "https://github.com/acme/lib.git", None),
        ])
        .await;
        install(&triggers, vec![trigger("a", "app", json!({ "type": "push" }))]).await;

        let own = matcher.match_event(&push("acme/app", "master")).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].spec.project.as_deref(), Some("a"));
        assert_eq!(own[0].spec.initiator, "alice");
        assert_eq!(own[0].spec.arguments["event"]["branch"], "master");

        let other = matcher.match_event(&push("acme/lib", "master")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_default_branch_is_owner_branch() {
        let (triggers, matcher) =
            setup(&[("a", "app", "https://github.com/acme/app.git", Some("dev"))]).await;
        install(&triggers, vec![trigger("a", "app", json!({}))]).await;

        assert!(matcher.match_event(&push("acme/app", "master")).await.unwrap().is_empty());
        assert_eq!(matcher.match_event(&push("acme/app", "dev")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cross_project_fan_out_fires_once_per_trigger() {
        let (triggers, matcher) = setup(&[
            ("a", "app", "https://github.com/acme/app.git", None),
            ("b", "app", "https://github.com/acme/app.git", None),
            ("c", "watcher", "https://github.com/acme/watcher.git", None),
        ])
        .await;
        install(
            &triggers,
            vec![
                trigger("a", "app", json!({})),
                trigger("b", "app", json!({})),
                trigger(
                    "c",
                    "watcher",
                    json!({ "project": ".*", "repository": ".*", "branch": ".*" }),
                ),
            ],
        )
        .await;

        let matches = matcher.match_event(&push("acme/app", "master")).await.unwrap();
        // a and b through their own repository, c once despite two contexts
        assert_eq!(matches.len(), 3);
        let created: HashSet<_> = matches.iter().map(|m| m.spec.created_at).collect();
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let (triggers, matcher) = setup(&[("a", "app", "https://github.com/acme/app.git", None)]).await;
        install(
            &triggers,
            vec![
                trigger("a", "app", json!({ "repository": ".*", "branch": ".*" })),
                trigger(
                    "a",
                    "app",
                    json!({ "repository": ".*", "branch": ".*", "unknownRepo": true }),
                ),
                trigger(
                    "a",
                    "app",
                    json!({ "repository": ".*", "branch": ".*", "unknownRepo": [true, false] }),
                ),
            ],
        )
        .await;

        let unknown = matcher.match_event(&push("acme/elsewhere", "master")).await.unwrap();
        assert_eq!(unknown.len(), 2);
        assert_eq!(unknown[0].spec.arguments["event"]["unknownRepo"], true);
        assert_eq!(unknown[0].spec.arguments["event"]["org"], UNKNOWN);

        let known = matcher.match_event(&push("acme/app", "master")).await.unwrap();
        assert_eq!(known.len(), 2);
    }

    #[tokio::test]
    async fn test_query_params_condition() {
        let (triggers, matcher) = setup(&[("a", "app", "https://github.com/acme/app.git", None)]).await;
        install(
            &triggers,
            vec![trigger("a", "app", json!({ "queryParams": { "env": "prod" } }))],
        )
        .await;

        let without = matcher.match_event(&push("acme/app", "master")).await.unwrap();
        assert!(without.is_empty());

        let with = push("acme/app", "master").with_query_param("env", "prod");
        assert_eq!(matcher.match_event(&with).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_on_empty_push() {
        let (triggers, matcher) = setup(&[("a", "app", "https://github.com/acme/app.git", None)]).await;
        let ignore = trigger("a", "app", json!({}));
        let mut fire = trigger("a", "app", json!({}));
        fire.on_empty = OnEmpty::Fire;
        let mut route = trigger("a", "app", json!({}));
        route.on_empty = OnEmpty::Route("onEmpty".to_string());
        install(&triggers, vec![ignore, fire, route]).await;

        let empty = push("acme/app", "master").with_empty(true);
        let matches = matcher.match_event(&empty).await.unwrap();
        let entries: Vec<_> = matches
            .iter()
            .filter_map(|m| m.spec.entry_point.clone())
            .collect();
        assert_eq!(entries, vec!["onPush".to_string(), "onEmpty".to_string()]);
    }

    #[tokio::test]
    async fn test_deleted_ref_disables_repository() {
        let (triggers, matcher) =
            setup(&[("a", "app", "https://github.com/acme/app.git", Some("feature"))]).await;
        install(&triggers, vec![trigger("a", "app", json!({}))]).await;

        let mut deleted = push("acme/app", "feature");
        deleted.deleted_ref = true;
        assert!(matcher.match_event(&deleted).await.unwrap().is_empty());
        assert!(triggers.all().await.is_empty());
        assert!(matcher.match_event(&push("acme/app", "feature")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detached_event_matches_on_conditions_only() {
        let (triggers, matcher) = setup(&[]).await;
        let mut external = trigger("a", "app", json!({ "kind": "deploy" }));
        external.event_source = "jenkins".to_string();
        install(&triggers, vec![external]).await;

        let event = InboundEvent::new("jenkins").with_attribute("kind", json!("deploy"));
        let matches = matcher.match_event(&event).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].spec.initiator, "jenkins");
    }
}
