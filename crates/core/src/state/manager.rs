//! State manager for coordinating process instances.
//!
//! The StateManager is the only component that changes process status. Each
//! operation applies a [`process`](crate::state::process) function inside a
//! store update and then performs the bookkeeping that follows it: exclusive
//! group claims, named locks, handler processes and event notifications.

use crate::checkpoint::CheckpointStore;
use crate::config::loader::parse_definition_entries;
use crate::error::{CoreError, CoreResult};
use crate::exclusive::{Admission, ClaimState, ExclusiveGroupArbiter, RebuildEntry};
use crate::locks::{org_scope, project_scope, LockOutcome, ProcessLockManager};
use crate::policy::PolicyEngine;
use crate::repository::refresh::DEFAULT_ENTRY_POINT;
use crate::repository::{RepositoryKey, RepositoryRegistry};
use crate::state::process::{check_resume, log_line, new_instance, restore_transition, transition};
use crate::store::ProcessStore;
use crate::workers::base::LockScope;
use crate::workers::pool::compile_requirements;
use chrono::{DateTime, Duration, Utc};
use fg_protocol::checkpoint_models::Checkpoint;
use fg_protocol::config_models::LimitsConfig;
use fg_protocol::ipc::Event;
use fg_protocol::process_models::{
    AwaitedCondition, ExclusiveKey, HeldLock, LogEntry, ProcessArchive, ProcessHandlers, ProcessInstance,
    ProcessKind, ProcessSpec, ProcessStatus, ResumePayload,
};
use fg_protocol::repository_models::RepositoryDefinition;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

/// Flow started when a process fails, unless the start request names another.
pub const ON_FAILURE_FLOW: &str = "onFailure";

/// Flow started when a running process is cancelled.
pub const ON_CANCEL_FLOW: &str = "onCancel";

/// Flow started when a process times out.
pub const ON_TIMEOUT_FLOW: &str = "onTimeout";

/// Outcome of [`StateManager::dispatch`].
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// The instance is now RUNNING on the worker.
    Started(Box<ProcessInstance>),

    /// Redelivery of an instance already running on the same worker.
    AlreadyDispatched,

    /// The instance is gated, gone terminal or taken by another worker.
    Skipped,
}

/// Manages the lifecycle of all process instances.
///
/// The StateManager provides a centralized interface for:
/// - Creating and admitting processes
/// - Dispatch bookkeeping for the queue dispatcher
/// - Suspending, resuming, killing and restoring processes
/// - Exclusive group claims and named locks
pub struct StateManager {
    store: Arc<ProcessStore>,
    checkpoints: Arc<CheckpointStore>,
    repositories: Arc<RepositoryRegistry>,
    arbiter: ExclusiveGroupArbiter,
    locks: ProcessLockManager,
    policy: PolicyEngine,
    limits: LimitsConfig,

    /// Channel for broadcasting process events.
    events_tx: broadcast::Sender<Event>,

    /// Status watches of running executions, removed on terminal states.
    watchers: Mutex<HashMap<Uuid, watch::Sender<ProcessStatus>>>,
}

impl StateManager {
    /// Create a new StateManager.
    ///
    /// # Arguments
    ///
    /// * `store` - Process store, shared with persistence
    /// * `checkpoints` - Checkpoint store, shared with persistence
    /// * `repositories` - Source of definitions for repository starts
    /// * `policy` - Admission rules
    /// * `limits` - Archive limits applied by `create`
    /// * `events_tx` - Channel for broadcasting events
    pub fn new(
        store: Arc<ProcessStore>,
        checkpoints: Arc<CheckpointStore>,
        repositories: Arc<RepositoryRegistry>,
        policy: PolicyEngine,
        limits: LimitsConfig,
        events_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            store,
            checkpoints,
            repositories,
            arbiter: ExclusiveGroupArbiter::new(),
            locks: ProcessLockManager::new(),
            policy,
            limits,
            events_tx,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<ProcessStore> {
        &self.store
    }

    pub fn arbiter(&self) -> &ExclusiveGroupArbiter {
        &self.arbiter
    }

    pub fn locks(&self) -> &ProcessLockManager {
        &self.locks
    }

    /// Subscribe to process events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Validate a start specification and write a NEW instance.
    ///
    /// The definition comes from the archive, an inline definition, or the
    /// stored definition of the referenced repository, in that order. Its
    /// configuration supplies defaults the spec does not set.
    ///
    /// # Errors
    ///
    /// - `Validation` naming the offending path or field
    /// - `RepositoryNotFound` if the referenced repository has no definition
    /// - `Config` if an archive definition file is not valid YAML
    pub async fn create(&self, spec: ProcessSpec) -> CoreResult<Uuid> {
        if let Some(archive) = &spec.archive {
            self.validate_archive(archive)?;
        }
        for resource in &spec.resources {
            validate_relative_path("resources", resource)?;
        }
        if let Some(parent_id) = spec.parent_id {
            if self.store.get(parent_id).await.is_none() {
                return Err(CoreError::Validation(format!(
                    "parentInstanceId: process {parent_id} not found"
                )));
            }
        }

        let definition = self.resolve_definition(&spec).await?;
        let (spec, entry_point) = apply_configuration(spec, &definition)?;

        let process = new_instance(&spec, entry_point);
        let id = process.id;
        let kind = process.kind;
        let parent_id = process.parent_id;
        self.store.insert(process).await;

        if let Some(parent) = parent_id {
            self.store
                .update(parent, |p| {
                    p.children_ids.push(id);
                    Ok(())
                })
                .await?;
        }

        tracing::info!(process_id = %id, ?kind, "Process created");
        self.emit(Event::ProcessCreated {
            process_id: id,
            kind,
            parent_id,
        });
        Ok(id)
    }

    /// Run the admission gates of a NEW instance.
    ///
    /// NEW -> PREPARING, then the policy check (a denial fails the process
    /// with a log line naming the rule) and exclusive group admission.
    ///
    /// # Returns
    ///
    /// The resulting status: ENQUEUED (possibly gated on its group), FAILED
    /// or CANCELLED.
    pub async fn enqueue(&self, id: Uuid) -> CoreResult<ProcessStatus> {
        let process = self
            .store
            .update(id, |p| {
                transition(p, ProcessStatus::Preparing)?;
                Ok(p.clone())
            })
            .await?;
        self.status_changed(id, ProcessStatus::Preparing).await;

        match self.policy.check(&process) {
            Ok(()) => {}
            Err(CoreError::AdmissionDenied { rule, reason }) => {
                tracing::info!(process_id = %id, rule = %rule, "Process denied by policy");
                self.terminate(
                    id,
                    ProcessStatus::Failed,
                    format!("Process rejected by policy rule '{rule}': {reason}"),
                )
                .await?;
                return Ok(ProcessStatus::Failed);
            }
            Err(e) => return Err(e),
        }

        let Some(key) = process.exclusive.clone() else {
            self.set_status(id, ProcessStatus::Enqueued).await?;
            return Ok(ProcessStatus::Enqueued);
        };

        self.admit_exclusive(id, key).await
    }

    /// Exclusive group admission of a PREPARING instance.
    ///
    /// A claim taken here is given back if the instance can no longer be
    /// enqueued, e.g. because it was killed or displaced while being
    /// admitted.
    async fn admit_exclusive(&self, id: Uuid, key: ExclusiveKey) -> CoreResult<ProcessStatus> {
        let ancestors = self.ancestors(id).await;
        let outcome = self.arbiter.admit(&key, id, &ancestors).await;
        for displaced in outcome.cancelled {
            tracing::info!(process_id = %displaced, group = %key.group, "Displaced from exclusive group");
            let line = format!(
                "Process '{id}' with exclusive group '{}' is already in the queue. Current process has been cancelled",
                key.group
            );
            if let Err(e) = self.terminate(displaced, ProcessStatus::Cancelled, line).await {
                tracing::warn!(process_id = %displaced, "Unable to cancel displaced process: {e}");
            }
        }

        match outcome.decision {
            Admission::Claimed => {
                match self.set_status(id, ProcessStatus::Enqueued).await {
                    Ok(()) => Ok(ProcessStatus::Enqueued),
                    Err(e) => self.admission_lost(&key, id, e).await,
                }
            }
            Admission::Nested => {
                let line = format!("Running inside exclusive group '{}' of a parent process", key.group);
                self.store
                    .update(id, |p| {
                        transition(p, ProcessStatus::Enqueued)?;
                        p.exclusive = None;
                        log_line(p, line.clone());
                        Ok(())
                    })
                    .await?;
                self.emit_log(id, line);
                self.status_changed(id, ProcessStatus::Enqueued).await;
                Ok(ProcessStatus::Enqueued)
            }
            Admission::Rejected => {
                let line = format!(
                    "Process(es) with exclusive group '{}' is already in the queue. Current process has been cancelled",
                    key.group
                );
                self.terminate(id, ProcessStatus::Cancelled, line).await?;
                Ok(ProcessStatus::Cancelled)
            }
            Admission::Waiting => {
                let line = format!("Waiting for exclusive group '{}'", key.group);
                let condition = AwaitedCondition::ExclusiveGroup {
                    scope: key.scope.clone(),
                    group: key.group.clone(),
                };
                let parked = self
                    .store
                    .update(id, |p| {
                        transition(p, ProcessStatus::Enqueued)?;
                        p.awaiting = Some(condition);
                        log_line(p, line.clone());
                        Ok(())
                    })
                    .await;
                if let Err(e) = parked {
                    return self.admission_lost(&key, id, e).await;
                }
                self.emit_log(id, line);
                self.status_changed(id, ProcessStatus::Enqueued).await;

                // the holder may have finished while we were parking
                if matches!(self.arbiter.holder(&key).await, Some((holder, _)) if holder == id) {
                    self.wake(id).await?;
                }
                Ok(ProcessStatus::Enqueued)
            }
        }
    }

    /// Parent, grandparent and further ancestors of an instance.
    async fn ancestors(&self, id: Uuid) -> HashSet<Uuid> {
        let mut ancestors = HashSet::new();
        let mut next = self.store.get(id).await.and_then(|p| p.parent_id);
        while let Some(parent_id) = next {
            if !ancestors.insert(parent_id) {
                break;
            }
            next = self.store.get(parent_id).await.and_then(|p| p.parent_id);
        }
        ancestors
    }

    /// Drop the claim or queue slot of an instance that ended while being
    /// admitted. Its terminal status is the admission result.
    async fn admission_lost(
        &self,
        key: &ExclusiveKey,
        id: Uuid,
        err: CoreError,
    ) -> CoreResult<ProcessStatus> {
        if let Some(next) = self.arbiter.release(key, id).await {
            tracing::info!(process_id = %next, group = %key.group, "Exclusive group handed over");
            self.wake_logged(next).await;
        }
        match self.store.get(id).await {
            Some(p) if p.status.is_terminal() => {
                tracing::info!(process_id = %id, status = %p.status, "Process ended during admission");
                Ok(p.status)
            }
            _ => Err(err),
        }
    }

    /// `create` followed by `enqueue`.
    pub async fn start(&self, spec: ProcessSpec) -> CoreResult<(Uuid, ProcessStatus)> {
        let id = self.create(spec).await?;
        let status = self.enqueue(id).await?;
        Ok((id, status))
    }

    /// Hand a runnable instance to a worker.
    ///
    /// ENQUEUED -> STARTING -> RUNNING, or RESUMING -> RUNNING. The exclusive
    /// claim moves to RUNNING before the status does, so an arriving
    /// `cancelOld` process can no longer displace it; an instance that lost
    /// its claim is not dispatched. Redelivery to the same worker is
    /// idempotent.
    pub async fn dispatch(&self, id: Uuid, worker_id: &str) -> CoreResult<Dispatch> {
        let claim = match self.store.get(id).await {
            Some(p) if is_dispatchable(&p) => match p.exclusive {
                Some(key) => {
                    let previous = self.arbiter.mark_running(&key, id).await;
                    if previous.is_none() {
                        tracing::info!(process_id = %id, group = %key.group, "Not dispatched, exclusive group claim lost");
                        return Ok(Dispatch::Skipped);
                    }
                    Some((key, previous))
                }
                None => None,
            },
            _ => None,
        };

        let worker = worker_id.to_string();
        let result = self
            .store
            .update(id, move |p| match p.status {
                ProcessStatus::Enqueued if p.awaiting.is_none() => {
                    transition(p, ProcessStatus::Starting)?;
                    transition(p, ProcessStatus::Running)?;
                    p.worker_id = Some(worker);
                    Ok((
                        Dispatch::Started(Box::new(p.clone())),
                        vec![ProcessStatus::Starting, ProcessStatus::Running],
                    ))
                }
                ProcessStatus::Resuming if p.awaiting.is_none() => {
                    transition(p, ProcessStatus::Running)?;
                    p.worker_id = Some(worker);
                    Ok((
                        Dispatch::Started(Box::new(p.clone())),
                        vec![ProcessStatus::Running],
                    ))
                }
                ProcessStatus::Starting | ProcessStatus::Running
                    if p.worker_id.as_deref() == Some(worker.as_str()) =>
                {
                    Ok((Dispatch::AlreadyDispatched, Vec::new()))
                }
                _ => Ok((Dispatch::Skipped, Vec::new())),
            })
            .await;

        let started = matches!(&result, Ok((Dispatch::Started(_), _)));
        if let Some((key, Some(ClaimState::Queued))) = &claim {
            // another worker may have won the race and be running it
            let running = self.store.get(id).await.is_some_and(|p| {
                matches!(p.status, ProcessStatus::Starting | ProcessStatus::Running)
            });
            if !started && !running {
                self.arbiter.mark_queued(key, id).await;
            }
        }
        let (dispatch, changes) = result?;
        if started {
            tracing::info!(process_id = %id, worker_id, "Process dispatched");
        }
        for status in changes {
            self.status_changed(id, status).await;
        }
        Ok(dispatch)
    }

    /// Park a RUNNING instance on a condition.
    ///
    /// # Arguments
    ///
    /// * `id` - The instance to suspend
    /// * `condition` - What the instance waits for
    /// * `snapshot` - Cursor to continue from once resumed
    pub async fn suspend(&self, id: Uuid, condition: AwaitedCondition, snapshot: Value) -> CoreResult<()> {
        let line = format!("Process suspended: {}", condition.reason());
        self.store
            .update(id, |p| {
                transition(p, ProcessStatus::Suspended)?;
                p.awaiting = Some(condition);
                p.snapshot = Some(snapshot);
                p.resume_payload = None;
                log_line(p, line.clone());
                Ok(())
            })
            .await?;
        self.emit_log(id, line);
        self.status_changed(id, ProcessStatus::Suspended).await;
        Ok(())
    }

    /// Resume a SUSPENDED instance with a form submission or external event.
    ///
    /// # Errors
    ///
    /// Returns `NotResumable` if the instance is not waiting for this payload.
    pub async fn resume(&self, id: Uuid, payload: ResumePayload) -> CoreResult<()> {
        let line = format!("Process resumed by '{}'", payload.event);
        self.store
            .update(id, |p| {
                check_resume(p.status, p.awaiting.as_ref(), &payload)
                    .map_err(|reason| CoreError::NotResumable { id, reason })?;
                transition(p, ProcessStatus::Resuming)?;
                p.awaiting = None;
                p.resume_payload = Some(payload);
                log_line(p, line.clone());
                Ok(())
            })
            .await?;
        self.emit_log(id, line);
        self.status_changed(id, ProcessStatus::Resuming).await;
        self.emit(Event::ProcessResumed { process_id: id });
        Ok(())
    }

    /// Cancel a non-terminal instance.
    ///
    /// Spawns the cancel handler when declared and the process had started.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the instance is already terminal.
    pub async fn kill(&self, id: Uuid) -> CoreResult<()> {
        let process = self
            .terminate(id, ProcessStatus::Cancelled, "Process cancelled")
            .await?;
        self.spawn_handler(&process, ProcessKind::CancelHandler).await;
        Ok(())
    }

    /// Fail an instance and spawn its failure handler when declared.
    pub async fn fail(&self, id: Uuid, cause: impl Into<String>) -> CoreResult<()> {
        let line = format!("Process failed: {}", cause.into());
        let process = self.terminate(id, ProcessStatus::Failed, line).await?;
        self.spawn_handler(&process, ProcessKind::FailureHandler).await;
        Ok(())
    }

    /// Complete a RUNNING instance, copying declared out variables into meta.
    pub async fn finish(&self, id: Uuid, outputs: Map<String, Value>) -> CoreResult<()> {
        self.terminate_with(id, ProcessStatus::Finished, "Process finished", |p| {
            for name in &p.out_variables {
                if let Some(value) = outputs.get(name) {
                    p.meta.insert(name.clone(), value.clone());
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Time out a RUNNING or SUSPENDED instance and spawn its timeout handler.
    pub async fn time_out(&self, id: Uuid) -> CoreResult<()> {
        let process = self
            .terminate(id, ProcessStatus::TimedOut, "Process timed out")
            .await?;
        self.spawn_handler(&process, ProcessKind::TimeoutHandler).await;
        Ok(())
    }

    /// Rewind an instance to a checkpoint.
    ///
    /// Allowed from terminal states and SUSPENDED. The instance re-enters
    /// RESUMING with the checkpoint's cursor; log lines are kept, so a replay
    /// appends to the existing log.
    ///
    /// # Errors
    ///
    /// - `RestoreNotAllowed` from any other status
    /// - `CheckpointNotFound` if the checkpoint is not the instance's
    pub async fn restore_checkpoint(&self, id: Uuid, checkpoint_id: Uuid) -> CoreResult<ProcessStatus> {
        let process = self.store.require(id).await?;
        if !process.status.is_restorable() {
            return Err(CoreError::RestoreNotAllowed(process.status));
        }
        let checkpoint = self.checkpoints.restore(id, checkpoint_id).await?;

        let line = format!("Restoring from checkpoint '{}'", checkpoint.name);
        let previous = self
            .store
            .update(id, |p| {
                let previous = p.status;
                restore_transition(p)?;
                p.snapshot = Some(checkpoint.snapshot.clone());
                p.awaiting = None;
                p.resume_payload = None;
                p.held_locks.clear();
                p.running_since = None;
                log_line(p, line.clone());
                Ok(previous)
            })
            .await?;
        tracing::info!(process_id = %id, checkpoint_id = %checkpoint_id, "Process restored");
        self.emit_log(id, line);
        self.status_changed(id, ProcessStatus::Resuming).await;

        if previous == ProcessStatus::Suspended {
            for granted in self.locks.release_all(id).await {
                self.wake_logged(granted).await;
            }
        }

        if let Some(key) = &process.exclusive {
            if self.arbiter.enqueue_waiter(key, id).await == Admission::Waiting {
                let condition = AwaitedCondition::ExclusiveGroup {
                    scope: key.scope.clone(),
                    group: key.group.clone(),
                };
                self.store
                    .update(id, |p| {
                        p.awaiting = Some(condition);
                        Ok(())
                    })
                    .await?;
                if matches!(self.arbiter.holder(key).await, Some((holder, _)) if holder == id) {
                    self.wake(id).await?;
                }
            }
        }
        Ok(ProcessStatus::Resuming)
    }

    /// Request a named lock for a RUNNING instance.
    ///
    /// A queued request suspends the instance with `waiting-on-lock`; it is
    /// resumed from `snapshot` once the lock is granted.
    pub async fn acquire_lock(
        &self,
        id: Uuid,
        scope: LockScope,
        key: &str,
        snapshot: Value,
    ) -> CoreResult<LockOutcome> {
        let process = self.store.require(id).await?;
        let scope = lock_scope(&process, scope);
        let outcome = self.locks.acquire(&scope, key, id).await;

        let recorded = match outcome {
            LockOutcome::Granted => {
                let line = format!("Lock '{key}' acquired");
                let held = HeldLock {
                    scope: scope.clone(),
                    key: key.to_string(),
                };
                let result = self
                    .store
                    .update(id, |p| {
                        if !p.held_locks.contains(&held) {
                            p.held_locks.push(held);
                        }
                        log_line(p, line.clone());
                        Ok(())
                    })
                    .await;
                if result.is_ok() {
                    self.emit_log(id, line);
                }
                result
            }
            LockOutcome::Queued { position } => {
                tracing::debug!(process_id = %id, lock = %key, position, "Lock queued");
                let condition = AwaitedCondition::Lock {
                    scope: scope.clone(),
                    key: key.to_string(),
                };
                self.suspend(id, condition, snapshot).await
            }
        };

        if let Err(e) = recorded {
            for granted in self.locks.release_all(id).await {
                self.wake_logged(granted).await;
            }
            return Err(e);
        }

        if matches!(outcome, LockOutcome::Queued { .. })
            && self.locks.holder(&scope, key).await == Some(id)
        {
            self.wake(id).await?;
        }
        Ok(outcome)
    }

    /// Release a named lock and resume the next waiter.
    pub async fn release_lock(&self, id: Uuid, scope: LockScope, key: &str) -> CoreResult<()> {
        let process = self.store.require(id).await?;
        let scope = lock_scope(&process, scope);
        let next = self.locks.release(&scope, key, id).await;

        let line = format!("Lock '{key}' released");
        self.store
            .update(id, |p| {
                p.held_locks.retain(|h| !(h.scope == scope && h.key == key));
                log_line(p, line.clone());
                Ok(())
            })
            .await?;
        self.emit_log(id, line);

        if let Some(next) = next {
            self.wake_logged(next).await;
        }
        Ok(())
    }

    /// Record a checkpoint of an instance.
    pub async fn create_checkpoint(
        &self,
        id: Uuid,
        name: impl Into<String>,
        snapshot: Value,
    ) -> CoreResult<Checkpoint> {
        self.store.require(id).await?;
        let checkpoint = self.checkpoints.create_checkpoint(id, name, snapshot).await;
        tracing::debug!(process_id = %id, checkpoint = %checkpoint.name, sequence = checkpoint.sequence, "Checkpoint created");
        self.emit(Event::CheckpointCreated {
            process_id: id,
            checkpoint_id: checkpoint.id,
            name: checkpoint.name.clone(),
        });
        Ok(checkpoint)
    }

    /// Time out instances whose budget elapsed.
    ///
    /// RUNNING instances are measured from their first RUNNING, SUSPENDED
    /// ones from the moment they were suspended.
    ///
    /// # Returns
    ///
    /// The instances that were timed out.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for p in self
            .store
            .list_by_status(&[ProcessStatus::Running, ProcessStatus::Suspended])
            .await
        {
            let deadline = match p.status {
                ProcessStatus::Running => p
                    .timeout_secs
                    .zip(p.running_since)
                    .and_then(|(secs, since)| deadline_after(since, secs)),
                _ => p
                    .suspend_timeout_secs
                    .and_then(|secs| deadline_after(p.status_since(), secs)),
            };
            if !deadline.is_some_and(|d| d <= now) {
                continue;
            }
            match self.time_out(p.id).await {
                Ok(()) => expired.push(p.id),
                Err(e) => tracing::warn!(process_id = %p.id, "Unable to time out process: {e}"),
            }
        }
        expired
    }

    /// Rebuild claim and lock tables after a persisted state was loaded.
    ///
    /// Instances caught STARTING or RUNNING are failed, instances caught in
    /// PREPARING are failed, NEW instances are admitted again. Waiters of
    /// groups and locks that nobody holds any more are promoted and resumed.
    pub async fn recover(&self) -> CoreResult<()> {
        let processes = self.store.list().await;
        let live: Vec<&ProcessInstance> = processes
            .iter()
            .filter(|p| {
                !p.status.is_terminal()
                    && !matches!(p.status, ProcessStatus::New | ProcessStatus::Preparing)
            })
            .collect();

        let mut claimed: HashSet<(String, String)> = live
            .iter()
            .filter(|p| !awaits_group(p))
            .filter_map(|p| p.exclusive.as_ref())
            .map(|k| (k.scope.clone(), k.group.clone()))
            .collect();

        let mut entries = Vec::new();
        let mut promoted = Vec::new();
        let mut holders = Vec::new();
        let mut waiters = Vec::new();
        for p in &live {
            if let Some(key) = &p.exclusive {
                let claim = if !awaits_group(p) {
                    let running = p.has_started()
                        || matches!(p.status, ProcessStatus::Starting | ProcessStatus::Running);
                    Some(if running {
                        ClaimState::Running
                    } else {
                        ClaimState::Queued
                    })
                } else if claimed.insert((key.scope.clone(), key.group.clone())) {
                    promoted.push(p.id);
                    Some(ClaimState::Queued)
                } else {
                    None
                };
                entries.push(RebuildEntry {
                    key: key.clone(),
                    process_id: p.id,
                    claim,
                });
            }

            holders.extend(
                p.held_locks
                    .iter()
                    .map(|h| (h.scope.clone(), h.key.clone(), p.id)),
            );
            if let (ProcessStatus::Suspended, Some(AwaitedCondition::Lock { scope, key })) =
                (p.status, &p.awaiting)
            {
                waiters.push((scope.clone(), key.clone(), p.id));
            }
        }

        self.arbiter.rebuild(entries).await;
        promoted.extend(self.locks.rebuild(holders, waiters).await);
        for id in promoted {
            self.wake_logged(id).await;
        }

        for p in &processes {
            let result = match p.status {
                ProcessStatus::Starting | ProcessStatus::Running => {
                    self.fail(p.id, "the server stopped while the process was running")
                        .await
                }
                ProcessStatus::Preparing => self
                    .terminate(
                        p.id,
                        ProcessStatus::Failed,
                        "Process failed: admission was interrupted by a server restart",
                    )
                    .await
                    .map(|_| ()),
                ProcessStatus::New => self.enqueue(p.id).await.map(|_| ()),
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!(process_id = %p.id, "Recovery of process failed: {e}");
            }
        }

        tracing::info!(processes = processes.len(), "State recovered");
        Ok(())
    }

    /// Dispatchable instances (ENQUEUED or RESUMING, not gated), oldest first.
    pub async fn runnable(&self) -> Vec<ProcessInstance> {
        self.store
            .list_by_status(&[ProcessStatus::Enqueued, ProcessStatus::Resuming])
            .await
            .into_iter()
            .filter(|p| p.awaiting.is_none())
            .collect()
    }

    /// Append a log line to an instance.
    pub async fn log(&self, id: Uuid, line: impl Into<String>) -> CoreResult<()> {
        let line = line.into();
        self.store
            .update(id, |p| {
                log_line(p, line.clone());
                Ok(())
            })
            .await?;
        self.emit_log(id, line);
        Ok(())
    }

    /// Set a metadata entry of an instance.
    pub async fn update_meta(&self, id: Uuid, key: String, value: Value) -> CoreResult<()> {
        self.store
            .update(id, |p| {
                p.meta.insert(key, value);
                Ok(())
            })
            .await
    }

    /// Watch the status of an instance.
    ///
    /// The sender side is dropped once the instance reaches a terminal state.
    pub async fn watch(&self, id: Uuid) -> CoreResult<watch::Receiver<ProcessStatus>> {
        let mut watchers = self.watchers.lock().await;
        let status = self.store.require(id).await?.status;
        if status.is_terminal() {
            let (_, rx) = watch::channel(status);
            return Ok(rx);
        }
        let tx = watchers
            .entry(id)
            .or_insert_with(|| watch::channel(status).0);
        Ok(tx.subscribe())
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<ProcessInstance> {
        self.store.require(id).await
    }

    pub async fn list(&self) -> Vec<ProcessInstance> {
        self.store.list().await
    }

    /// Checkpoints of an instance, oldest first.
    pub async fn checkpoints(&self, id: Uuid) -> CoreResult<Vec<Checkpoint>> {
        self.store.require(id).await?;
        Ok(self.checkpoints.list_checkpoints(id).await)
    }

    pub async fn logs(&self, id: Uuid) -> CoreResult<Vec<LogEntry>> {
        Ok(self.store.require(id).await?.logs)
    }

    async fn resolve_definition(&self, spec: &ProcessSpec) -> CoreResult<RepositoryDefinition> {
        if let Some(archive) = &spec.archive {
            return Ok(parse_definition_entries(&archive.entries)?);
        }
        if let Some(value) = &spec.definition {
            return serde_json::from_value(value.clone())
                .map_err(|e| CoreError::Validation(format!("definition: {e}")));
        }
        match (&spec.org, &spec.project, &spec.repo) {
            (Some(org), Some(project), Some(repo)) => {
                let key = RepositoryKey::new(org, project, repo);
                self.repositories
                    .definition(&key)
                    .await
                    .ok_or_else(|| CoreError::RepositoryNotFound(key.to_string()))
            }
            _ => Err(CoreError::Validation(
                "no process definition: supply an archive or an org/project/repo reference"
                    .to_string(),
            )),
        }
    }

    fn validate_archive(&self, archive: &ProcessArchive) -> CoreResult<()> {
        if archive.entries.len() > self.limits.max_archive_entries {
            return Err(CoreError::Validation(format!(
                "archive: {} entries exceed the limit of {}",
                archive.entries.len(),
                self.limits.max_archive_entries
            )));
        }
        let bytes = archive.total_bytes();
        if bytes > self.limits.max_archive_bytes {
            return Err(CoreError::Validation(format!(
                "archive: {bytes} bytes exceed the limit of {}",
                self.limits.max_archive_bytes
            )));
        }
        for entry in &archive.entries {
            validate_relative_path("archive", &entry.path)?;
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, to: ProcessStatus) -> CoreResult<()> {
        self.store.update(id, |p| transition(p, to)).await?;
        self.status_changed(id, to).await;
        Ok(())
    }

    async fn terminate(
        &self,
        id: Uuid,
        to: ProcessStatus,
        line: impl Into<String>,
    ) -> CoreResult<ProcessInstance> {
        self.terminate_with(id, to, line, |_| {}).await
    }

    /// Move an instance into a terminal state and release what it holds.
    async fn terminate_with<F>(
        &self,
        id: Uuid,
        to: ProcessStatus,
        line: impl Into<String>,
        prepare: F,
    ) -> CoreResult<ProcessInstance>
    where
        F: FnOnce(&mut ProcessInstance),
    {
        let line = line.into();
        let process = self
            .store
            .update(id, |p| {
                transition(p, to)?;
                prepare(p);
                p.awaiting = None;
                p.held_locks.clear();
                log_line(p, line.clone());
                Ok(p.clone())
            })
            .await?;

        tracing::info!(process_id = %id, status = %to, "Process ended");
        self.emit_log(id, line.clone());
        self.status_changed(id, to).await;
        match to {
            ProcessStatus::Finished => self.emit(Event::ProcessCompleted { process_id: id }),
            ProcessStatus::Cancelled => self.emit(Event::ProcessKilled { process_id: id }),
            _ => self.emit(Event::ProcessError {
                process_id: id,
                error: line,
            }),
        }

        self.finalize(&process).await;
        Ok(process)
    }

    /// Release the exclusive claim and every lock of a terminated instance.
    async fn finalize(&self, process: &ProcessInstance) {
        if let Some(key) = &process.exclusive {
            if let Some(next) = self.arbiter.release(key, process.id).await {
                tracing::info!(process_id = %next, group = %key.group, "Exclusive group handed over");
                self.wake_logged(next).await;
            }
        }
        for granted in self.locks.release_all(process.id).await {
            self.wake_logged(granted).await;
        }
    }

    /// Lift an internal gate (lock or exclusive group) from an instance.
    ///
    /// A SUSPENDED instance moves to RESUMING; a gated ENQUEUED or RESUMING
    /// instance becomes dispatchable. A granted lock is recorded as held.
    ///
    /// # Returns
    ///
    /// `true` if the instance was waiting on an internal gate.
    async fn wake(&self, id: Uuid) -> CoreResult<bool> {
        let resumed = self
            .store
            .update(id, |p| {
                let gated = matches!(&p.awaiting, Some(c) if c.is_internal());
                let parked = matches!(
                    p.status,
                    ProcessStatus::Suspended | ProcessStatus::Enqueued | ProcessStatus::Resuming
                );
                if !gated || !parked {
                    return Ok(None);
                }
                if let Some(AwaitedCondition::Lock { scope, key }) = p.awaiting.take() {
                    let held = HeldLock { scope, key };
                    if !p.held_locks.contains(&held) {
                        p.held_locks.push(held);
                    }
                }
                if p.status == ProcessStatus::Suspended {
                    transition(p, ProcessStatus::Resuming)?;
                    return Ok(Some(true));
                }
                Ok(Some(false))
            })
            .await?;

        if resumed == Some(true) {
            self.status_changed(id, ProcessStatus::Resuming).await;
            self.emit(Event::ProcessResumed { process_id: id });
        }
        Ok(resumed.is_some())
    }

    async fn wake_logged(&self, id: Uuid) {
        if let Err(e) = self.wake(id).await {
            tracing::warn!(process_id = %id, "Unable to resume process: {e}");
        }
    }

    /// Start the handler process of a terminated parent, if declared.
    async fn spawn_handler(&self, parent: &ProcessInstance, kind: ProcessKind) -> Option<Uuid> {
        if parent.kind.is_handler() {
            return None;
        }
        let entry_point = match kind {
            ProcessKind::FailureHandler => parent.handlers.on_failure.clone(),
            ProcessKind::CancelHandler if parent.has_started() => parent.handlers.on_cancel.clone(),
            ProcessKind::TimeoutHandler => parent.handlers.on_timeout.clone(),
            _ => None,
        }?;

        let spec = ProcessSpec {
            org: parent.org.clone(),
            project: parent.project.clone(),
            repo: parent.repo.clone(),
            initiator: parent.initiator.clone(),
            parent_id: Some(parent.id),
            kind,
            entry_point: Some(entry_point),
            arguments: parent.arguments.clone(),
            requirements: parent.requirements.clone(),
            definition: parent.definition.clone(),
            ..Default::default()
        };
        match self.start(spec).await {
            Ok((child, _)) => {
                tracing::info!(process_id = %parent.id, child_id = %child, ?kind, "Handler process started");
                Some(child)
            }
            Err(e) => {
                tracing::warn!(process_id = %parent.id, ?kind, "Unable to start handler process: {e}");
                None
            }
        }
    }

    async fn status_changed(&self, id: Uuid, status: ProcessStatus) {
        tracing::debug!(process_id = %id, %status, "Status changed");
        self.emit(Event::ProcessStatusUpdate {
            process_id: id,
            status,
        });
        let mut watchers = self.watchers.lock().await;
        if let Some(tx) = watchers.get(&id) {
            tx.send_replace(status);
        }
        if status.is_terminal() {
            watchers.remove(&id);
        }
    }

    fn emit_log(&self, id: Uuid, content: String) {
        self.emit(Event::ProcessLogChunk {
            process_id: id,
            content,
        });
    }

    fn emit(&self, event: Event) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

fn is_dispatchable(p: &ProcessInstance) -> bool {
    matches!(p.status, ProcessStatus::Enqueued | ProcessStatus::Resuming) && p.awaiting.is_none()
}

/// Longest accepted `timeout` or `suspendTimeout`, one hundred years.
pub const MAX_TIMEOUT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// The moment a budget of `secs` started at `since` runs out.
///
/// `None` when the deadline is not representable, which never expires.
fn deadline_after(since: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    Duration::try_seconds(secs).and_then(|budget| since.checked_add_signed(budget))
}

fn validate_timeout(field: &str, secs: Option<u64>) -> CoreResult<()> {
    match secs {
        Some(secs) if secs > MAX_TIMEOUT_SECS => Err(CoreError::Validation(format!(
            "{field}: {secs} seconds exceeds the maximum of {MAX_TIMEOUT_SECS}"
        ))),
        _ => Ok(()),
    }
}

/// Reject absolute paths and paths leaving the workspace.
///
/// # Errors
///
/// Returns `Validation` naming `field` and the offending path.
pub fn validate_relative_path(field: &str, path: &str) -> CoreResult<()> {
    let p = Path::new(path);
    if path.is_empty() {
        return Err(CoreError::Validation(format!("{field}: empty path")));
    }
    if p.has_root() || p.is_absolute() {
        return Err(CoreError::Validation(format!(
            "{field}: absolute path '{path}' is not allowed"
        )));
    }
    if p.components().any(|c| c == Component::ParentDir) {
        return Err(CoreError::Validation(format!(
            "{field}: path '{path}' must not contain '..'"
        )));
    }
    Ok(())
}

/// Fill a start specification from the definition's configuration.
///
/// Values set on the spec win. Handler processes get no handlers and no
/// exclusive group of their own.
fn apply_configuration(
    mut spec: ProcessSpec,
    definition: &RepositoryDefinition,
) -> CoreResult<(ProcessSpec, String)> {
    let cfg = &definition.configuration;
    let entry_point = spec
        .entry_point
        .clone()
        .or_else(|| cfg.entry_point.clone())
        .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string());
    if !definition.flows.contains_key(&entry_point) {
        return Err(CoreError::Validation(format!(
            "entryPoint: flow '{entry_point}' not found"
        )));
    }
    for resource in &cfg.resources {
        validate_relative_path("configuration.resources", resource)?;
    }

    spec.arguments = overlay(&cfg.arguments, spec.arguments);
    spec.requirements = overlay(&cfg.requirements, spec.requirements);
    spec.meta = overlay(&cfg.meta, spec.meta);
    spec.timeout_secs = spec.timeout_secs.or(cfg.timeout);
    spec.suspend_timeout_secs = spec.suspend_timeout_secs.or(cfg.suspend_timeout);
    validate_timeout("configuration.timeout", spec.timeout_secs)?;
    validate_timeout("configuration.suspendTimeout", spec.suspend_timeout_secs)?;
    if spec.out_variables.is_empty() {
        spec.out_variables = cfg.out.clone();
    }
    let mut dependencies = cfg.dependencies.clone();
    dependencies.extend(spec.dependencies);
    spec.dependencies = dependencies;
    compile_requirements(&spec.requirements)?;

    if spec.kind.is_handler() {
        spec.handlers = ProcessHandlers::default();
        spec.exclusive = None;
    } else {
        spec.exclusive = spec.exclusive.or_else(|| cfg.exclusive.clone());
        let declared = |name: &str| definition.flows.contains_key(name).then(|| name.to_string());
        spec.handlers.on_failure = spec.handlers.on_failure.or_else(|| declared(ON_FAILURE_FLOW));
        spec.handlers.on_cancel = spec.handlers.on_cancel.or_else(|| declared(ON_CANCEL_FLOW));
        spec.handlers.on_timeout = spec.handlers.on_timeout.or_else(|| declared(ON_TIMEOUT_FLOW));
        for flow in [
            &spec.handlers.on_failure,
            &spec.handlers.on_cancel,
            &spec.handlers.on_timeout,
        ]
        .into_iter()
        .flatten()
        {
            if !definition.flows.contains_key(flow) {
                return Err(CoreError::Validation(format!(
                    "handlers: flow '{flow}' not found"
                )));
            }
        }
    }

    spec.definition = Some(
        serde_json::to_value(definition)
            .map_err(|e| CoreError::Validation(format!("definition: {e}")))?,
    );
    spec.entry_point = Some(entry_point.clone());
    Ok((spec, entry_point))
}

fn overlay(base: &Map<String, Value>, overrides: Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    merged.extend(overrides);
    merged
}

fn awaits_group(process: &ProcessInstance) -> bool {
    matches!(process.awaiting, Some(AwaitedCondition::ExclusiveGroup { .. }))
}

fn lock_scope(process: &ProcessInstance, scope: LockScope) -> String {
    let org = process.org.as_deref().unwrap_or_default();
    match scope {
        LockScope::Org => org_scope(org),
        LockScope::Project => project_scope(org, process.project.as_deref().unwrap_or_default()),
    }
}
