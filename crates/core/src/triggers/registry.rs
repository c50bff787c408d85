//! Trigger registry.
//!
//! Triggers are grouped by owning repository. A refresh replaces a
//! repository's group in one write; matching only ever reads.

use crate::error::CoreResult;
use crate::repository::RepositoryKey;
use crate::triggers::matcher::CompiledConditions;
use fg_protocol::trigger_models::{Trigger, TriggerQuery};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A trigger with its conditions compiled.
#[derive(Debug)]
pub struct CompiledTrigger {
    pub trigger: Trigger,
    pub conditions: CompiledConditions,
}

impl CompiledTrigger {
    /// Compile a trigger's conditions.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a condition regex does not compile.
    pub fn compile(trigger: Trigger) -> CoreResult<Self> {
        let conditions = CompiledConditions::compile(&trigger.conditions)?;
        Ok(Self {
            trigger,
            conditions,
        })
    }

    /// Owning repository.
    pub fn owner(&self) -> RepositoryKey {
        RepositoryKey::new(
            self.trigger.org.clone(),
            self.trigger.project.clone(),
            self.trigger.repo.clone(),
        )
    }
}

/// All registered triggers, keyed by owning repository.
#[derive(Default)]
pub struct TriggerRegistry {
    by_repository: RwLock<BTreeMap<RepositoryKey, Vec<Arc<CompiledTrigger>>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace all triggers owned by a repository.
    ///
    /// Every trigger is compiled before the registry is touched, so a
    /// definition with a bad condition leaves the previous triggers in place.
    ///
    /// # Returns
    ///
    /// The number of triggers now registered for the repository.
    pub async fn replace_repository(
        &self,
        key: RepositoryKey,
        triggers: Vec<Trigger>,
    ) -> CoreResult<usize> {
        let compiled = triggers
            .into_iter()
            .map(|t| CompiledTrigger::compile(t).map(Arc::new))
            .collect::<CoreResult<Vec<_>>>()?;
        let count = compiled.len();

        let mut map = self.by_repository.write().await;
        if compiled.is_empty() {
            map.remove(&key);
        } else {
            map.insert(key, compiled);
        }
        Ok(count)
    }

    /// Drop all triggers owned by a repository.
    pub async fn remove_repository(&self, key: &RepositoryKey) -> usize {
        self.by_repository
            .write()
            .await
            .remove(key)
            .map_or(0, |v| v.len())
    }

    /// Triggers listening to an event source.
    pub async fn by_source(&self, source: &str) -> Vec<Arc<CompiledTrigger>> {
        self.by_repository
            .read()
            .await
            .values()
            .flatten()
            .filter(|t| t.trigger.event_source == source)
            .cloned()
            .collect()
    }

    /// Triggers accepted by a query, in repository order.
    pub async fn list(&self, query: &TriggerQuery) -> Vec<Trigger> {
        self.by_repository
            .read()
            .await
            .values()
            .flatten()
            .filter(|t| query.accepts(&t.trigger))
            .map(|t| t.trigger.clone())
            .collect()
    }

    /// Every trigger, for snapshots.
    pub async fn all(&self) -> Vec<Trigger> {
        self.list(&TriggerQuery::default()).await
    }

    /// Replace the whole registry from persisted triggers.
    ///
    /// Triggers that no longer compile are skipped and reported.
    pub async fn restore(&self, triggers: Vec<Trigger>) -> usize {
        let mut grouped: BTreeMap<RepositoryKey, Vec<Arc<CompiledTrigger>>> = BTreeMap::new();
        let mut restored = 0;
        for trigger in triggers {
            let id = trigger.id;
            match CompiledTrigger::compile(trigger) {
                Ok(compiled) => {
                    grouped.entry(compiled.owner()).or_default().push(Arc::new(compiled));
                    restored += 1;
                }
                Err(e) => tracing::warn!(trigger_id = %id, "Skipping persisted trigger: {e}"),
            }
        }
        *self.by_repository.write().await = grouped;
        restored
    }
}
