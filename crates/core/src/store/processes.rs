//! In-memory process store.
//!
//! The store exclusively owns process instances. Other components refer to
//! instances by id and read them through the store.

use crate::error::{CoreError, CoreResult};
use fg_protocol::process_models::{ProcessInstance, ProcessStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct StoreInner {
    processes: HashMap<Uuid, ProcessInstance>,
    next_seq: u64,
}

/// Registry of all process instances, indexed by id.
///
/// Every mutation goes through [`ProcessStore::update`], which runs a closure
/// under the write lock so read-modify-write sequences are atomic.
#[derive(Default)]
pub struct ProcessStore {
    inner: RwLock<StoreInner>,
    version: AtomicU64,
}

impl ProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new instance, assigning its insertion sequence number.
    ///
    /// # Returns
    ///
    /// The sequence number assigned to the instance.
    pub async fn insert(&self, mut process: ProcessInstance) -> u64 {
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        process.seq = seq;
        inner.processes.insert(process.id, process);
        self.version.fetch_add(1, Ordering::SeqCst);
        seq
    }

    /// Get a copy of an instance.
    pub async fn get(&self, id: Uuid) -> Option<ProcessInstance> {
        self.inner.read().await.processes.get(&id).cloned()
    }

    /// Get a copy of an instance or fail with `ProcessNotFound`.
    pub async fn require(&self, id: Uuid) -> CoreResult<ProcessInstance> {
        self.get(id).await.ok_or(CoreError::ProcessNotFound(id))
    }

    /// Atomically mutate an instance.
    ///
    /// # Arguments
    ///
    /// * `id` - The instance to mutate
    /// * `f` - Mutation; if it returns an error the instance is left untouched
    ///
    /// # Errors
    ///
    /// Returns `ProcessNotFound` if the instance does not exist, or the
    /// closure's error.
    pub async fn update<F, R>(&self, id: Uuid, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut ProcessInstance) -> CoreResult<R>,
    {
        let mut inner = self.inner.write().await;
        let process = inner
            .processes
            .get_mut(&id)
            .ok_or(CoreError::ProcessNotFound(id))?;

        let mut draft = process.clone();
        let result = f(&mut draft)?;
        *process = draft;
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    /// All instances ordered by `created_at`, then insertion order.
    pub async fn list(&self) -> Vec<ProcessInstance> {
        let inner = self.inner.read().await;
        let mut all: Vec<ProcessInstance> = inner.processes.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        all
    }

    /// Instances in any of the given statuses, oldest first.
    pub async fn list_by_status(&self, statuses: &[ProcessStatus]) -> Vec<ProcessInstance> {
        self.list()
            .await
            .into_iter()
            .filter(|p| statuses.contains(&p.status))
            .collect()
    }

    /// Replace the whole content, e.g. after loading a snapshot.
    pub async fn replace_all(&self, processes: Vec<ProcessInstance>) {
        let mut inner = self.inner.write().await;
        inner.next_seq = processes.iter().map(|p| p.seq + 1).max().unwrap_or(0);
        inner.processes = processes.into_iter().map(|p| (p.id, p)).collect();
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Monotonic counter bumped on every write.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Get the number of stored instances.
    pub async fn len(&self) -> usize {
        self.inner.read().await.processes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
