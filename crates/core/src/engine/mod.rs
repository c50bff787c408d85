//! Queue dispatcher.
//!
//! The QueueDispatcher is responsible for handing runnable process instances
//! to workers and driving the resulting event streams: log lines, metadata,
//! checkpoints, suspension, locks and completion. It also enforces the
//! execution timeout of each instance and stops driving an instance as soon
//! as it is killed.

use crate::error::{CoreError, CoreResult};
use crate::locks::LockOutcome;
use crate::state::{Dispatch, StateManager};
use crate::workers::base::{Job, WorkerError, WorkerEvent};
use crate::workers::pool::{WorkerLease, WorkerPool};
use crate::workers::retry::{resolve_all, DependencyResolver, RetryPolicy};
use chrono::Utc;
use fg_protocol::process_models::{ProcessInstance, ProcessStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use uuid::Uuid;

/// Whether to keep reading a worker's stream after an event.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

/// Dispatches runnable instances to the worker pool.
#[derive(Clone)]
pub struct QueueDispatcher {
    manager: Arc<StateManager>,
    pool: Arc<WorkerPool>,
    resolver: Arc<dyn DependencyResolver>,
    retry: RetryPolicy,
    dependency_timeout: Duration,
}

impl QueueDispatcher {
    /// Create a new QueueDispatcher.
    ///
    /// # Arguments
    ///
    /// * `manager` - Owner of all status changes
    /// * `pool` - Workers to dispatch to
    /// * `resolver` - Resolves process dependencies before execution
    /// * `retry` - Retry policy for transient worker failures
    /// * `dependency_timeout` - Budget for resolving a single dependency
    pub fn new(
        manager: Arc<StateManager>,
        pool: Arc<WorkerPool>,
        resolver: Arc<dyn DependencyResolver>,
        retry: RetryPolicy,
        dependency_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            pool,
            resolver,
            retry,
            dependency_timeout,
        }
    }

    /// Dispatch every runnable instance a worker slot is free for.
    ///
    /// Instances are considered oldest first. An instance no free worker
    /// satisfies stays queued for the next poll.
    ///
    /// # Returns
    ///
    /// Handles of the executions started by this poll.
    pub async fn poll_once(&self) -> Vec<JoinHandle<()>> {
        let mut started = Vec::new();
        for process in self.manager.runnable().await {
            let lease = match self.pool.acquire(&process.requirements) {
                Ok(Some(lease)) => lease,
                Ok(None) => continue,
                Err(e) => {
                    self.record_failure(process.id, e).await;
                    continue;
                }
            };

            match self.manager.dispatch(process.id, lease.worker_id()).await {
                Ok(Dispatch::Started(process)) => {
                    let dispatcher = self.clone();
                    started.push(tokio::spawn(dispatcher.execute(*process, lease)));
                }
                Ok(Dispatch::AlreadyDispatched | Dispatch::Skipped) => {}
                Err(e) => {
                    tracing::warn!(process_id = %process.id, "Dispatch failed: {e}");
                }
            }
        }
        started
    }

    /// Time out instances whose budget elapsed.
    pub async fn sweep(&self) -> Vec<Uuid> {
        self.manager.sweep_timeouts(Utc::now()).await
    }

    /// Run one execution; errors are recorded against the instance.
    async fn execute(self, process: ProcessInstance, lease: WorkerLease) {
        let id = process.id;
        tracing::debug!(process_id = %id, worker_id = lease.worker_id(), "Execution started");
        if let Err(e) = self.drive(process, &lease).await {
            self.record_failure(id, e).await;
        }
        tracing::debug!(process_id = %id, "Execution ended");
    }

    /// Drive a worker's event stream until the execution ends.
    ///
    /// # Errors
    ///
    /// Returns the worker error that ended the execution, or the core error
    /// of an event that could not be applied.
    async fn drive(&self, process: ProcessInstance, lease: &WorkerLease) -> CoreResult<()> {
        let id = process.id;
        let mut status = self.manager.watch(id).await?;

        // a continuation already resolved its dependencies
        if process.snapshot.is_none() && !process.dependencies.is_empty() {
            resolve_all(
                self.resolver.as_ref(),
                &process.dependencies,
                self.dependency_timeout,
                &self.retry,
            )
            .await?;
        }

        let job = Job::from(&process);
        let worker = lease.worker();
        let mut stream = self.retry.run(|_| worker.execute(&job)).await?;

        let budget = remaining_budget(&process);
        let deadline = async {
            match budget {
                Some(budget) => tokio::time::sleep(budget).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if self.apply(id, event).await? == Step::Stop {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(WorkerError::Execution(
                            "worker stream ended without a final event".to_string(),
                        )
                        .into())
                    }
                },
                changed = status.changed() => {
                    let current = *status.borrow();
                    if changed.is_err() || current != ProcessStatus::Running {
                        tracing::info!(process_id = %id, status = %current, "Execution interrupted");
                        return Ok(());
                    }
                }
                _ = &mut deadline => {
                    tracing::info!(process_id = %id, "Execution budget exhausted");
                    return self.manager.time_out(id).await;
                }
            }
        }
    }

    /// Apply one worker event to the instance.
    async fn apply(&self, id: Uuid, event: WorkerEvent) -> CoreResult<Step> {
        match event {
            WorkerEvent::Log { line } => self.manager.log(id, line).await?,
            WorkerEvent::Meta { key, value } => self.manager.update_meta(id, key, value).await?,
            WorkerEvent::Checkpoint { name, snapshot } => {
                self.manager.create_checkpoint(id, name, snapshot).await?;
            }
            WorkerEvent::Suspend {
                condition,
                snapshot,
            } => {
                self.manager.suspend(id, condition, snapshot).await?;
                return Ok(Step::Stop);
            }
            WorkerEvent::AcquireLock {
                scope,
                key,
                snapshot,
            } => {
                let outcome = self.manager.acquire_lock(id, scope, &key, snapshot).await?;
                if let LockOutcome::Queued { .. } = outcome {
                    return Ok(Step::Stop);
                }
            }
            WorkerEvent::ReleaseLock { scope, key } => {
                self.manager.release_lock(id, scope, &key).await?;
            }
            WorkerEvent::Finished { out } => {
                self.manager.finish(id, out).await?;
                return Ok(Step::Stop);
            }
            WorkerEvent::Failed { error } => {
                self.manager.fail(id, error).await?;
                return Ok(Step::Stop);
            }
        }
        Ok(Step::Continue)
    }

    async fn record_failure(&self, id: Uuid, error: CoreError) {
        let cause = match error {
            CoreError::Worker(e) => e.to_string(),
            other => other.to_string(),
        };
        if let Err(e) = self.manager.fail(id, cause).await {
            // already terminal, e.g. killed while the worker was running
            tracing::debug!(process_id = %id, "Unable to record failure: {e}");
        }
    }
}

/// Time left of the instance's execution budget, measured from its first RUNNING.
fn remaining_budget(process: &ProcessInstance) -> Option<Duration> {
    let secs = process.timeout_secs?;
    let elapsed = process
        .running_since
        .map(|since| (Utc::now() - since).to_std().unwrap_or_default())
        .unwrap_or_default();
    Some(Duration::from_secs(secs).saturating_sub(elapsed))
}
