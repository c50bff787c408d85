//! Checkpoint store.
//!
//! Checkpoints are appended per process with a strictly increasing sequence
//! number. Restoring never removes entries; a replay after a restore appends
//! new checkpoints after the existing ones, so repeated restores always work
//! against the current log.

use crate::error::{CoreError, CoreResult};
use chrono::Utc;
use fg_protocol::checkpoint_models::Checkpoint;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Ordered, append-only log of checkpoints per process.
#[derive(Default)]
pub struct CheckpointStore {
    inner: RwLock<HashMap<Uuid, Vec<Checkpoint>>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a checkpoint at the next sequence position.
    ///
    /// # Arguments
    ///
    /// * `process_id` - Owning process
    /// * `name` - Checkpoint name, need not be unique
    /// * `snapshot` - Execution cursor positioned right after the checkpoint
    pub async fn create_checkpoint(
        &self,
        process_id: Uuid,
        name: impl Into<String>,
        snapshot: Value,
    ) -> Checkpoint {
        let mut inner = self.inner.write().await;
        let log = inner.entry(process_id).or_default();
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            process_id,
            name: name.into(),
            created_at: Utc::now(),
            sequence: log.len() as u64,
            snapshot,
        };
        log.push(checkpoint.clone());
        checkpoint
    }

    /// Checkpoints of a process in creation order.
    pub async fn list_checkpoints(&self, process_id: Uuid) -> Vec<Checkpoint> {
        self.inner
            .read()
            .await
            .get(&process_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Produce the execution cursor for a restore.
    ///
    /// # Errors
    ///
    /// Returns `CheckpointNotFound` if the checkpoint does not exist or does
    /// not belong to `process_id`.
    pub async fn restore(&self, process_id: Uuid, checkpoint_id: Uuid) -> CoreResult<Checkpoint> {
        self.inner
            .read()
            .await
            .get(&process_id)
            .and_then(|log| log.iter().find(|c| c.id == checkpoint_id))
            .cloned()
            .ok_or(CoreError::CheckpointNotFound(checkpoint_id))
    }

    /// All checkpoints, for snapshots.
    pub async fn all(&self) -> Vec<Checkpoint> {
        let inner = self.inner.read().await;
        let mut all: Vec<Checkpoint> = inner.values().flatten().cloned().collect();
        all.sort_by(|a, b| {
            a.process_id
                .cmp(&b.process_id)
                .then(a.sequence.cmp(&b.sequence))
        });
        all
    }

    /// Replace the whole content, e.g. after loading a snapshot.
    pub async fn replace_all(&self, checkpoints: Vec<Checkpoint>) {
        let mut map: HashMap<Uuid, Vec<Checkpoint>> = HashMap::new();
        for c in checkpoints {
            map.entry(c.process_id).or_default().push(c);
        }
        for log in map.values_mut() {
            log.sort_by_key(|c| c.sequence);
        }
        *self.inner.write().await = map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequences_are_per_process() {
        let store = CheckpointStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let a0 = store.create_checkpoint(a, "one", json!({})).await;
        let a1 = store.create_checkpoint(a, "one", json!({})).await;
        let b0 = store.create_checkpoint(b, "one", json!({})).await;

        assert_eq!((a0.sequence, a1.sequence, b0.sequence), (0, 1, 0));
        assert_ne!(a0.id, a1.id);
    }

    #[tokio::test]
    async fn test_list_in_creation_order() {
        let store = CheckpointStore::new();
        let pid = Uuid::new_v4();
        for name in ["Start", "Middle", "End"] {
            store.create_checkpoint(pid, name, json!({ "name": name })).await;
        }

        let names: Vec<String> = store
            .list_checkpoints(pid)
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Start", "Middle", "End"]);
    }

    #[tokio::test]
    async fn test_restore_returns_snapshot() {
        let store = CheckpointStore::new();
        let pid = Uuid::new_v4();
        let cp = store.create_checkpoint(pid, "Middle", json!({ "step": 4 })).await;

        let restored = store.restore(pid, cp.id).await.unwrap();
        assert_eq!(restored.snapshot, json!({ "step": 4 }));
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_checkpoint() {
        let store = CheckpointStore::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let cp = store.create_checkpoint(owner, "Start", json!({})).await;

        let result = store.restore(other, cp.id).await;
        assert!(matches!(result, Err(CoreError::CheckpointNotFound(id)) if id == cp.id));
    }

    #[tokio::test]
    async fn test_replace_all_restores_order() {
        let store = CheckpointStore::new();
        let pid = Uuid::new_v4();
        let first = store.create_checkpoint(pid, "a", json!({})).await;
        let second = store.create_checkpoint(pid, "b", json!({})).await;

        let fresh = CheckpointStore::new();
        fresh.replace_all(vec![second, first]).await;

        let names: Vec<String> = fresh
            .list_checkpoints(pid)
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
