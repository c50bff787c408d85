//! Named process locks.
//!
//! A lock is identified by a scope and a key. Scopes are disjoint
//! namespaces (`org:<org>`, `project:<org>/<project>`), so an organization
//! lock never contends with a project lock of the same name.

use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Result of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,

    /// Position in the wait queue, starting at 1.
    Queued { position: usize },
}

/// Lock scope of an organization.
pub fn org_scope(org: &str) -> String {
    format!("org:{org}")
}

/// Lock scope of a project.
pub fn project_scope(org: &str, project: &str) -> String {
    format!("project:{org}/{project}")
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Uuid>,
    waiting: VecDeque<Uuid>,
}

type LockId = (String, String);

/// FIFO lock table keyed by (scope, key).
#[derive(Default)]
pub struct ProcessLockManager {
    locks: Mutex<HashMap<LockId, LockState>>,
}

impl ProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock for a process.
    ///
    /// Re-entrant: the current holder is granted again. A process already
    /// waiting keeps its position.
    pub async fn acquire(&self, scope: &str, key: &str, process_id: Uuid) -> LockOutcome {
        let mut locks = self.locks.lock().await;
        let lock = locks
            .entry((scope.to_string(), key.to_string()))
            .or_default();

        match lock.holder {
            None => {
                lock.holder = Some(process_id);
                LockOutcome::Granted
            }
            Some(holder) if holder == process_id => LockOutcome::Granted,
            Some(_) => {
                let position = match lock.waiting.iter().position(|w| *w == process_id) {
                    Some(index) => index + 1,
                    None => {
                        lock.waiting.push_back(process_id);
                        lock.waiting.len()
                    }
                };
                LockOutcome::Queued { position }
            }
        }
    }

    /// Release a lock held by `process_id`.
    ///
    /// # Returns
    ///
    /// The next waiter, now holding the lock. `None` if the process did not
    /// hold the lock or nobody was waiting.
    pub async fn release(&self, scope: &str, key: &str, process_id: Uuid) -> Option<Uuid> {
        let mut locks = self.locks.lock().await;
        let id = (scope.to_string(), key.to_string());
        let lock = locks.get_mut(&id)?;
        if lock.holder != Some(process_id) {
            return None;
        }

        lock.holder = lock.waiting.pop_front();
        let granted = lock.holder;
        if granted.is_none() {
            locks.remove(&id);
        }
        granted
    }

    /// Release everything a process holds and withdraw it from all queues.
    ///
    /// # Returns
    ///
    /// Waiters granted a lock as a result, in lock-table order.
    pub async fn release_all(&self, process_id: Uuid) -> Vec<Uuid> {
        let mut locks = self.locks.lock().await;
        let mut granted = Vec::new();

        for lock in locks.values_mut() {
            lock.waiting.retain(|w| *w != process_id);
            if lock.holder == Some(process_id) {
                lock.holder = lock.waiting.pop_front();
                granted.extend(lock.holder);
            }
        }
        locks.retain(|_, lock| lock.holder.is_some() || !lock.waiting.is_empty());
        granted
    }

    /// Current holder of a lock.
    pub async fn holder(&self, scope: &str, key: &str) -> Option<Uuid> {
        self.locks
            .lock()
            .await
            .get(&(scope.to_string(), key.to_string()))
            .and_then(|l| l.holder)
    }

    /// Waiters of a lock, oldest first.
    pub async fn waiters(&self, scope: &str, key: &str) -> Vec<Uuid> {
        self.locks
            .lock()
            .await
            .get(&(scope.to_string(), key.to_string()))
            .map(|l| l.waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replace the table with reconstructed holders and waiters.
    ///
    /// `waiters` must be ordered oldest first.
    ///
    /// # Returns
    ///
    /// Waiters of locks nobody holds any more; they now hold the lock and
    /// must be resumed by the caller.
    pub async fn rebuild(
        &self,
        holders: Vec<(String, String, Uuid)>,
        waiters: Vec<(String, String, Uuid)>,
    ) -> Vec<Uuid> {
        let mut locks: HashMap<LockId, LockState> = HashMap::new();
        let mut granted = Vec::new();
        for (scope, key, process_id) in holders {
            locks.entry((scope, key)).or_default().holder = Some(process_id);
        }
        for (scope, key, process_id) in waiters {
            let lock = locks.entry((scope, key)).or_default();
            if lock.holder.is_none() {
                lock.holder = Some(process_id);
                granted.push(process_id);
            } else {
                lock.waiting.push_back(process_id);
            }
        }
        *self.locks.lock().await = locks;
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_grant_order() {
        let locks = ProcessLockManager::new();
        let scope = project_scope("Default", "p");
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        assert_eq!(locks.acquire(&scope, "deploy", ids[0]).await, LockOutcome::Granted);
        assert_eq!(
            locks.acquire(&scope, "deploy", ids[1]).await,
            LockOutcome::Queued { position: 1 }
        );
        assert_eq!(
            locks.acquire(&scope, "deploy", ids[2]).await,
            LockOutcome::Queued { position: 2 }
        );

        assert_eq!(locks.release(&scope, "deploy", ids[0]).await, Some(ids[1]));
        assert_eq!(locks.holder(&scope, "deploy").await, Some(ids[1]));
        assert_eq!(locks.release(&scope, "deploy", ids[1]).await, Some(ids[2]));
        assert_eq!(locks.release(&scope, "deploy", ids[2]).await, None);
        assert_eq!(locks.holder(&scope, "deploy").await, None);
    }

    #[tokio::test]
    async fn test_reentrant_and_stable_position() {
        let locks = ProcessLockManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        locks.acquire("org:Default", "k", a).await;
        assert_eq!(locks.acquire("org:Default", "k", a).await, LockOutcome::Granted);
        locks.acquire("org:Default", "k", b).await;
        assert_eq!(
            locks.acquire("org:Default", "k", b).await,
            LockOutcome::Queued { position: 1 }
        );
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_ignored() {
        let locks = ProcessLockManager::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        locks.acquire("org:Default", "k", a).await;
        locks.acquire("org:Default", "k", b).await;

        assert_eq!(locks.release("org:Default", "k", b).await, None);
        assert_eq!(locks.holder("org:Default", "k").await, Some(a));
    }

    #[tokio::test]
    async fn test_scopes_do_not_contend() {
        let locks = ProcessLockManager::new();
        let org = org_scope("Default");
        let project = project_scope("Default", "k");

        assert_eq!(locks.acquire(&org, "k", Uuid::new_v4()).await, LockOutcome::Granted);
        assert_eq!(locks.acquire(&project, "k", Uuid::new_v4()).await, LockOutcome::Granted);
    }

    #[tokio::test]
    async fn test_release_all() {
        let locks = ProcessLockManager::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        locks.acquire("org:o", "one", a).await;
        locks.acquire("org:o", "one", b).await;
        locks.acquire("org:o", "two", c).await;
        locks.acquire("org:o", "two", a).await;

        // a holds "one" and waits on "two"
        assert_eq!(locks.release_all(a).await, vec![b]);
        assert_eq!(locks.holder("org:o", "one").await, Some(b));
        assert!(locks.waiters("org:o", "two").await.is_empty());
        assert!(locks.release_all(a).await.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild() {
        let locks = ProcessLockManager::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let granted = locks
            .rebuild(
                vec![("org:o".to_string(), "k".to_string(), a)],
                vec![
                    ("org:o".to_string(), "k".to_string(), b),
                    ("org:o".to_string(), "orphan".to_string(), c),
                ],
            )
            .await;
        assert_eq!(locks.holder("org:o", "k").await, Some(a));
        assert_eq!(locks.waiters("org:o", "k").await, vec![b]);
        assert_eq!(granted, vec![c]);
        assert_eq!(locks.holder("org:o", "orphan").await, Some(c));
    }
}
