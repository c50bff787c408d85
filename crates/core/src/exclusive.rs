//! Exclusive group arbiter.
//!
//! For every (scope, group) pair the arbiter keeps at most one claim and a
//! FIFO of waiting processes. A claim is QUEUED until its holder is
//! dispatched and RUNNING afterwards; only QUEUED claims can be taken over.
//! Descendants of the holder (forks, handlers) run under its claim and never
//! contend with it.
//! The arbiter only decides. Cancelling, suspending and resuming the
//! affected processes is done by the caller.

use fg_protocol::process_models::{ExclusiveKey, ExclusiveMode};
use fg_protocol::repository_models::ExclusiveSpec;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

/// State of an exclusive group claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Queued,
    Running,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    process_id: Uuid,
    state: ClaimState,
}

#[derive(Debug, Default)]
struct GroupState {
    holder: Option<Claim>,
    waiting: VecDeque<Uuid>,
}

impl GroupState {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiting.is_empty()
    }
}

/// Admission decision for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The process holds the (QUEUED) claim.
    Claimed,

    /// The process waits behind the holder.
    Waiting,

    /// The group is occupied and the process must be cancelled.
    Rejected,

    /// An ancestor holds the claim; the process runs under it without
    /// registering in the group.
    Nested,
}

/// Result of [`ExclusiveGroupArbiter::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub decision: Admission,

    /// Older processes displaced by this admission, to be cancelled.
    pub cancelled: Vec<Uuid>,
}

impl AdmissionOutcome {
    fn new(decision: Admission) -> Self {
        Self {
            decision,
            cancelled: Vec::new(),
        }
    }
}

/// A claim or waiter reconstructed from persisted processes.
#[derive(Debug, Clone)]
pub struct RebuildEntry {
    pub key: ExclusiveKey,
    pub process_id: Uuid,

    /// `None` for a waiter.
    pub claim: Option<ClaimState>,
}

type GroupId = (String, String);

fn group_id(key: &ExclusiveKey) -> GroupId {
    (key.scope.clone(), key.group.clone())
}

/// Serializes admission per exclusive group.
#[derive(Default)]
pub struct ExclusiveGroupArbiter {
    groups: Mutex<HashMap<GroupId, GroupState>>,
}

impl ExclusiveGroupArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a process into its exclusive group.
    ///
    /// - group held by one of `ancestors`: the process is nested
    /// - free group: the process claims it
    /// - `cancelOld`: a QUEUED holder is displaced; with a RUNNING holder the
    ///   process becomes the single waiter, displacing older waiters
    /// - `cancel`: the process is rejected
    /// - `wait`: the process joins the FIFO
    pub async fn admit(
        &self,
        key: &ExclusiveKey,
        process_id: Uuid,
        ancestors: &HashSet<Uuid>,
    ) -> AdmissionOutcome {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(group_id(key)).or_default();

        let holder = match group.holder {
            Some(claim) if ancestors.contains(&claim.process_id) => {
                return AdmissionOutcome::new(Admission::Nested);
            }
            None => {
                group.holder = Some(Claim {
                    process_id,
                    state: ClaimState::Queued,
                });
                return AdmissionOutcome::new(Admission::Claimed);
            }
            Some(claim) if claim.process_id == process_id => {
                return AdmissionOutcome::new(Admission::Claimed);
            }
            Some(claim) => claim,
        };

        match key.mode {
            ExclusiveMode::Cancel => AdmissionOutcome::new(Admission::Rejected),
            ExclusiveMode::Wait => {
                if !group.waiting.contains(&process_id) {
                    group.waiting.push_back(process_id);
                }
                AdmissionOutcome::new(Admission::Waiting)
            }
            ExclusiveMode::CancelOld => match holder.state {
                ClaimState::Queued => {
                    group.holder = Some(Claim {
                        process_id,
                        state: ClaimState::Queued,
                    });
                    AdmissionOutcome {
                        decision: Admission::Claimed,
                        cancelled: vec![holder.process_id],
                    }
                }
                ClaimState::Running => {
                    let cancelled: Vec<Uuid> = group
                        .waiting
                        .iter()
                        .copied()
                        .filter(|id| *id != process_id && !ancestors.contains(id))
                        .collect();
                    group
                        .waiting
                        .retain(|id| *id != process_id && ancestors.contains(id));
                    group.waiting.push_back(process_id);
                    AdmissionOutcome {
                        decision: Admission::Waiting,
                        cancelled,
                    }
                }
            },
        }
    }

    /// Put a process back in the waiting queue without displacing anyone.
    ///
    /// Used when a restored process finds its group occupied.
    pub async fn enqueue_waiter(&self, key: &ExclusiveKey, process_id: Uuid) -> Admission {
        let mut groups = self.groups.lock().await;
        let group = groups.entry(group_id(key)).or_default();
        match group.holder {
            None => {
                group.holder = Some(Claim {
                    process_id,
                    state: ClaimState::Queued,
                });
                Admission::Claimed
            }
            Some(claim) if claim.process_id == process_id => Admission::Claimed,
            Some(_) => {
                if !group.waiting.contains(&process_id) {
                    group.waiting.push_back(process_id);
                }
                Admission::Waiting
            }
        }
    }

    /// Move the claim QUEUED -> RUNNING.
    ///
    /// # Returns
    ///
    /// The state the claim had before, or `None` if `process_id` does not
    /// hold it.
    pub async fn mark_running(&self, key: &ExclusiveKey, process_id: Uuid) -> Option<ClaimState> {
        self.set_state(key, process_id, ClaimState::Running).await
    }

    /// Move the claim back to QUEUED after a dispatch that did not happen.
    pub async fn mark_queued(&self, key: &ExclusiveKey, process_id: Uuid) -> Option<ClaimState> {
        self.set_state(key, process_id, ClaimState::Queued).await
    }

    async fn set_state(
        &self,
        key: &ExclusiveKey,
        process_id: Uuid,
        state: ClaimState,
    ) -> Option<ClaimState> {
        let mut groups = self.groups.lock().await;
        match groups.get_mut(&group_id(key)).and_then(|g| g.holder.as_mut()) {
            Some(claim) if claim.process_id == process_id => {
                Some(std::mem::replace(&mut claim.state, state))
            }
            _ => None,
        }
    }

    /// Drop a process from its group, as holder or waiter.
    ///
    /// # Returns
    ///
    /// The waiter promoted to holder, if the released process held the claim.
    pub async fn release(&self, key: &ExclusiveKey, process_id: Uuid) -> Option<Uuid> {
        let mut groups = self.groups.lock().await;
        let id = group_id(key);
        let group = groups.get_mut(&id)?;

        let promoted = match group.holder {
            Some(claim) if claim.process_id == process_id => {
                let next = group.waiting.pop_front();
                group.holder = next.map(|process_id| Claim {
                    process_id,
                    state: ClaimState::Queued,
                });
                next
            }
            _ => {
                group.waiting.retain(|w| *w != process_id);
                None
            }
        };

        if group.is_idle() {
            groups.remove(&id);
        }
        promoted
    }

    /// Current holder of a group.
    pub async fn holder(&self, key: &ExclusiveKey) -> Option<(Uuid, ClaimState)> {
        self.groups
            .lock()
            .await
            .get(&group_id(key))
            .and_then(|g| g.holder)
            .map(|c| (c.process_id, c.state))
    }

    /// Waiting processes of a group, oldest first.
    pub async fn waiters(&self, key: &ExclusiveKey) -> Vec<Uuid> {
        self.groups
            .lock()
            .await
            .get(&group_id(key))
            .map(|g| g.waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Replace all groups with state reconstructed from the process store.
    ///
    /// `entries` must be ordered oldest first.
    pub async fn rebuild(&self, entries: Vec<RebuildEntry>) {
        let mut groups: HashMap<GroupId, GroupState> = HashMap::new();
        for entry in entries {
            let group = groups.entry(group_id(&entry.key)).or_default();
            match (entry.claim, group.holder) {
                (Some(state), None) => {
                    group.holder = Some(Claim {
                        process_id: entry.process_id,
                        state,
                    });
                }
                _ => group.waiting.push_back(entry.process_id),
            }
        }
        *self.groups.lock().await = groups;
    }
}

/// Resolve the exclusive key of a process.
///
/// The scope is `org/project`, partitioned by `#branch=<branch>` and/or
/// `#<attribute>=<value>` when the exclusive settings ask for it. Missing values
/// partition as empty strings.
pub fn resolve_key(
    spec: &ExclusiveSpec,
    org: Option<&str>,
    project: Option<&str>,
    attributes: &Map<String, Value>,
) -> ExclusiveKey {
    let mut scope = format!("{}/{}", org.unwrap_or_default(), project.unwrap_or_default());
    if spec.group_by_branch {
        scope.push_str(&format!("#branch={}", attribute_str(attributes, "branch")));
    }
    if let Some(name) = spec.group_by_event_attr.as_deref() {
        scope.push_str(&format!("#{name}={}", attribute_str(attributes, name)));
    }
    ExclusiveKey {
        scope,
        group: spec.group.clone(),
        mode: spec.mode,
    }
}

fn attribute_str(attributes: &Map<String, Value>, name: &str) -> String {
    match attributes.get(name) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(mode: ExclusiveMode) -> ExclusiveKey {
        ExclusiveKey {
            scope: "Default/p".to_string(),
            group: "RED".to_string(),
            mode,
        }
    }

    #[tokio::test]
    async fn test_cancel_old_replaces_queued_holder() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::CancelOld);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(arbiter.admit(&key, first, &HashSet::new()).await.decision, Admission::Claimed);
        let outcome = arbiter.admit(&key, second, &HashSet::new()).await;
        assert_eq!(outcome.decision, Admission::Claimed);
        assert_eq!(outcome.cancelled, vec![first]);
        assert_eq!(arbiter.holder(&key).await, Some((second, ClaimState::Queued)));
    }

    #[tokio::test]
    async fn test_cancel_old_never_preempts_running_holder() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::CancelOld);
        let (running, w1, w2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        arbiter.admit(&key, running, &HashSet::new()).await;
        assert_eq!(arbiter.mark_running(&key, running).await, Some(ClaimState::Queued));

        let outcome = arbiter.admit(&key, w1, &HashSet::new()).await;
        assert_eq!(outcome.decision, Admission::Waiting);
        assert!(outcome.cancelled.is_empty());

        let outcome = arbiter.admit(&key, w2, &HashSet::new()).await;
        assert_eq!(outcome.decision, Admission::Waiting);
        assert_eq!(outcome.cancelled, vec![w1]);
        assert_eq!(arbiter.waiters(&key).await, vec![w2]);

        assert_eq!(arbiter.release(&key, running).await, Some(w2));
        assert_eq!(arbiter.holder(&key).await, Some((w2, ClaimState::Queued)));
    }

    #[tokio::test]
    async fn test_cancel_mode_rejects_incoming() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::Cancel);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        arbiter.admit(&key, first, &HashSet::new()).await;
        let outcome = arbiter.admit(&key, second, &HashSet::new()).await;
        assert_eq!(outcome.decision, Admission::Rejected);
        assert!(outcome.cancelled.is_empty());
        assert_eq!(arbiter.holder(&key).await, Some((first, ClaimState::Queued)));
    }

    #[tokio::test]
    async fn test_wait_mode_is_fifo() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::Wait);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        for id in &ids {
            arbiter.admit(&key, *id, &HashSet::new()).await;
        }
        assert_eq!(arbiter.waiters(&key).await, ids[1..].to_vec());

        assert_eq!(arbiter.release(&key, ids[0]).await, Some(ids[1]));
        assert_eq!(arbiter.release(&key, ids[1]).await, Some(ids[2]));
        assert_eq!(arbiter.release(&key, ids[2]).await, None);
        assert_eq!(arbiter.holder(&key).await, None);
    }

    #[tokio::test]
    async fn test_release_of_waiter_does_not_promote() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::Wait);
        let (holder, waiter) = (Uuid::new_v4(), Uuid::new_v4());

        arbiter.admit(&key, holder, &HashSet::new()).await;
        arbiter.admit(&key, waiter, &HashSet::new()).await;
        assert_eq!(arbiter.release(&key, waiter).await, None);
        assert!(arbiter.waiters(&key).await.is_empty());
        assert_eq!(arbiter.holder(&key).await, Some((holder, ClaimState::Queued)));
    }

    #[tokio::test]
    async fn test_mark_running_requires_holder() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::Wait);
        let (holder, waiter) = (Uuid::new_v4(), Uuid::new_v4());
        arbiter.admit(&key, holder, &HashSet::new()).await;
        arbiter.admit(&key, waiter, &HashSet::new()).await;

        assert_eq!(arbiter.mark_running(&key, waiter).await, None);
        assert_eq!(arbiter.mark_running(&key, holder).await, Some(ClaimState::Queued));
        assert_eq!(arbiter.mark_queued(&key, holder).await, Some(ClaimState::Running));
        assert_eq!(arbiter.holder(&key).await, Some((holder, ClaimState::Queued)));
    }

    #[tokio::test]
    async fn test_descendants_of_the_holder_are_nested() {
        let arbiter = ExclusiveGroupArbiter::new();
        let (parent, child, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let lineage = HashSet::from([parent]);

        for mode in [ExclusiveMode::Cancel, ExclusiveMode::CancelOld, ExclusiveMode::Wait] {
            let key = key(mode);
            arbiter.admit(&key, parent, &HashSet::new()).await;
            let outcome = arbiter.admit(&key, child, &lineage).await;
            assert_eq!(outcome.decision, Admission::Nested);
            assert!(outcome.cancelled.is_empty());
            assert_eq!(arbiter.holder(&key).await, Some((parent, ClaimState::Queued)));
            assert!(arbiter.waiters(&key).await.is_empty());
            arbiter.release(&key, parent).await;
        }

        // an unrelated process still contends with the holder
        let key = key(ExclusiveMode::Cancel);
        arbiter.admit(&key, parent, &HashSet::new()).await;
        let outcome = arbiter.admit(&key, other, &HashSet::from([child])).await;
        assert_eq!(outcome.decision, Admission::Rejected);
    }

    #[tokio::test]
    async fn test_cancel_old_keeps_waiting_ancestors() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::CancelOld);
        let (running, parent, stranger, child) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        arbiter.admit(&key, running, &HashSet::new()).await;
        arbiter.mark_running(&key, running).await;
        arbiter.admit(&key, parent, &HashSet::new()).await;
        arbiter.enqueue_waiter(&key, stranger).await;

        let outcome = arbiter.admit(&key, child, &HashSet::from([parent])).await;
        assert_eq!(outcome.decision, Admission::Waiting);
        assert_eq!(outcome.cancelled, vec![stranger]);
        assert_eq!(arbiter.waiters(&key).await, vec![parent, child]);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let arbiter = ExclusiveGroupArbiter::new();
        let red = key(ExclusiveMode::Cancel);
        let blue = ExclusiveKey {
            group: "BLUE".to_string(),
            ..red.clone()
        };
        arbiter.admit(&red, Uuid::new_v4(), &HashSet::new()).await;
        assert_eq!(arbiter.admit(&blue, Uuid::new_v4(), &HashSet::new()).await.decision, Admission::Claimed);
    }

    #[tokio::test]
    async fn test_rebuild() {
        let arbiter = ExclusiveGroupArbiter::new();
        let key = key(ExclusiveMode::Wait);
        let (holder, waiter) = (Uuid::new_v4(), Uuid::new_v4());
        arbiter
            .rebuild(vec![
                RebuildEntry {
                    key: key.clone(),
                    process_id: holder,
                    claim: Some(ClaimState::Running),
                },
                RebuildEntry {
                    key: key.clone(),
                    process_id: waiter,
                    claim: None,
                },
            ])
            .await;

        assert_eq!(arbiter.holder(&key).await, Some((holder, ClaimState::Running)));
        assert_eq!(arbiter.waiters(&key).await, vec![waiter]);
    }

    #[test]
    fn test_resolve_key_partitions() {
        let attrs = json!({ "branch": "dev", "pr": 42 });
        let attrs = attrs.as_object().unwrap();
        let mut spec = ExclusiveSpec {
            group: "RED".to_string(),
            ..Default::default()
        };

        let plain = resolve_key(&spec, Some("Default"), Some("p"), attrs);
        assert_eq!(plain.scope, "Default/p");
        assert_eq!(plain.mode, ExclusiveMode::CancelOld);

        spec.group_by_branch = true;
        assert_eq!(
            resolve_key(&spec, Some("Default"), Some("p"), attrs).scope,
            "Default/p#branch=dev"
        );

        spec.group_by_event_attr = Some("pr".to_string());
        assert_eq!(
            resolve_key(&spec, Some("Default"), Some("p"), attrs).scope,
            "Default/p#branch=dev#pr=42"
        );

        spec.group_by_branch = false;
        spec.group_by_event_attr = Some("missing".to_string());
        assert_eq!(
            resolve_key(&spec, Some("Default"), Some("p"), attrs).scope,
            "Default/p#missing="
        );
    }
}
