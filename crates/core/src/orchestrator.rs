//! Orchestrator: the assembled core.
//!
//! Wires the stores, registries, state manager, dispatcher and trigger
//! sources built from a [`ServerConfig`], and owns the background loop that
//! dispatches work, sweeps timeouts, fires cron triggers and persists state.

use crate::checkpoint::CheckpointStore;
use crate::engine::QueueDispatcher;
use crate::error::CoreResult;
use crate::policy::PolicyEngine;
use crate::repository::{LocalPathFetcher, RepositoryFetcher, RepositoryRefresher, RepositoryRegistry};
use crate::state::StateManager;
use crate::store::snapshot::{self, PersistedState};
use crate::store::ProcessStore;
use crate::triggers::{CronScheduler, TriggerMatch, TriggerMatcher, TriggerRegistry};
use crate::workers::adapters::{CommandWorker, ScriptedWorker};
use crate::workers::base::Worker;
use crate::workers::pool::WorkerPool;
use crate::workers::retry::{RetryPolicy, SchemeResolver};
use chrono::Utc;
use fg_protocol::config_models::{ServerConfig, WorkerConfig};
use fg_protocol::event_models::InboundEvent;
use fg_protocol::ipc::Event;
use fg_protocol::process_models::{ProcessSpec, ProcessStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Worker registered when the configuration declares none.
const DEFAULT_WORKER_ID: &str = "local";
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// The assembled orchestration core.
pub struct Orchestrator {
    config: ServerConfig,
    manager: Arc<StateManager>,
    dispatcher: QueueDispatcher,
    store: Arc<ProcessStore>,
    checkpoints: Arc<CheckpointStore>,
    repositories: Arc<RepositoryRegistry>,
    triggers: Arc<TriggerRegistry>,
    matcher: TriggerMatcher,
    refresher: RepositoryRefresher,
    cron: CronScheduler,
    events_tx: broadcast::Sender<Event>,

    /// Store version of the last snapshot written.
    persisted_version: AtomicU64,
}

impl Orchestrator {
    /// Build the core from configuration.
    ///
    /// Repositories are fetched from their configured local checkouts.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a policy rule pattern does not compile.
    pub async fn from_config(config: ServerConfig) -> CoreResult<Self> {
        let repositories = Arc::new(RepositoryRegistry::new(config.github.default_branch.clone()));
        let fetcher = Arc::new(LocalPathFetcher::new(Arc::clone(&repositories)));
        Self::with_fetcher(config, repositories, fetcher).await
    }

    /// Build the core with a custom repository fetcher.
    pub async fn with_fetcher(
        config: ServerConfig,
        repositories: Arc<RepositoryRegistry>,
        fetcher: Arc<dyn RepositoryFetcher>,
    ) -> CoreResult<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        for repository in &config.repositories {
            repositories.register(repository).await;
        }

        let store = Arc::new(ProcessStore::new());
        let checkpoints = Arc::new(CheckpointStore::new());
        let triggers = Arc::new(TriggerRegistry::new());
        let manager = Arc::new(StateManager::new(
            Arc::clone(&store),
            Arc::clone(&checkpoints),
            Arc::clone(&repositories),
            PolicyEngine::new(&config.policy)?,
            config.limits.clone(),
            events_tx.clone(),
        ));

        let dispatcher = QueueDispatcher::new(
            Arc::clone(&manager),
            Arc::new(build_pool(&config.workers)),
            Arc::new(SchemeResolver::default()),
            RetryPolicy::from(&config.retry),
            Duration::from_secs(config.dependencies.timeout_secs),
        );
        let matcher = TriggerMatcher::new(
            Arc::clone(&triggers),
            Arc::clone(&repositories),
            config.github.disable_repos_on_deleted_ref,
        );
        let refresher = RepositoryRefresher::new(
            Arc::clone(&repositories),
            Arc::clone(&triggers),
            fetcher,
            events_tx.clone(),
        );
        let cron = CronScheduler::new(Arc::clone(&triggers), Utc::now());

        Ok(Self {
            config,
            manager,
            dispatcher,
            store,
            checkpoints,
            repositories,
            triggers,
            matcher,
            refresher,
            cron,
            events_tx,
            persisted_version: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<StateManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &QueueDispatcher {
        &self.dispatcher
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    pub fn repositories(&self) -> &Arc<RepositoryRegistry> {
        &self.repositories
    }

    /// Subscribe to core events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Start a process from an explicit request.
    pub async fn start(&self, spec: ProcessSpec) -> CoreResult<(Uuid, ProcessStatus)> {
        self.manager.start(spec).await
    }

    /// Match an inbound event and start one process per fired trigger.
    ///
    /// A trigger whose start fails is logged and skipped; the others still
    /// start.
    ///
    /// # Returns
    ///
    /// The ids of the instances created for this event.
    pub async fn handle_event(&self, event: &InboundEvent) -> CoreResult<Vec<Uuid>> {
        let matches = self.matcher.match_event(event).await?;
        Ok(self.start_matches(matches).await)
    }

    /// Refresh the repositories registered under `name`.
    ///
    /// # Returns
    ///
    /// The number of triggers the repositories now own.
    pub async fn refresh_repository(&self, name: &str) -> CoreResult<usize> {
        let count = self.refresher.refresh(name).await?;
        self.persist().await;
        Ok(count)
    }

    /// Refresh every registered repository, logging failures.
    pub async fn refresh_all(&self) {
        for repository in self.repositories.list().await {
            if let Err(e) = self.refresher.refresh_one(&repository).await {
                tracing::warn!(repository = %repository.name, "Initial refresh failed: {e}");
            }
        }
    }

    /// Load the persisted snapshot, if any, and reconcile it.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the snapshot exists but cannot be read.
    pub async fn load_state(&self) -> CoreResult<bool> {
        let Some(data_dir) = &self.config.data_dir else {
            return Ok(false);
        };
        let Some(state) = snapshot::load(data_dir)? else {
            return Ok(false);
        };

        let processes = state.processes.len();
        self.store.replace_all(state.processes).await;
        self.checkpoints.replace_all(state.checkpoints).await;
        self.repositories
            .restore(state.repositories, state.definitions)
            .await;
        let triggers = self.triggers.restore(state.triggers).await;
        self.manager.recover().await?;

        tracing::info!(processes, triggers, "Persisted state loaded");
        self.persist().await;
        Ok(true)
    }

    /// Write a snapshot if anything changed since the last one.
    pub async fn persist(&self) {
        let Some(data_dir) = &self.config.data_dir else {
            return;
        };
        let version = self.store.version();
        let state = PersistedState {
            processes: self.store.list().await,
            checkpoints: self.checkpoints.all().await,
            repositories: self.repositories.list().await,
            definitions: self.repositories.stored_definitions().await,
            triggers: self.triggers.all().await,
        };
        match snapshot::save(data_dir, &state) {
            Ok(()) => self.persisted_version.store(version, Ordering::SeqCst),
            Err(e) => tracing::error!("Unable to persist state: {e}"),
        }
    }

    /// One round of background work.
    ///
    /// Dispatches runnable instances, sweeps timeouts, fires due cron
    /// triggers and persists state if the store changed.
    pub async fn tick(&self) {
        let started = self.dispatcher.poll_once().await;
        if !started.is_empty() {
            tracing::debug!(started = started.len(), "Dispatched processes");
        }

        let expired = self.dispatcher.sweep().await;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Processes timed out");
        }

        let fired = self.cron.tick(Utc::now()).await;
        self.start_matches(fired).await;

        if self.store.version() != self.persisted_version.load(Ordering::SeqCst) {
            self.persist().await;
        }
    }

    /// Run the background loop. This never returns under normal operation.
    /// Spawn it as a background task via `tokio::spawn`.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.dispatcher.poll_interval_ms.max(1));
        tracing::info!("Dispatcher started (poll interval={interval:?})");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    async fn start_matches(&self, matches: Vec<TriggerMatch>) -> Vec<Uuid> {
        let mut started = Vec::new();
        for matched in matches {
            let trigger_id = matched.trigger.id;
            match self.manager.start(matched.spec).await {
                Ok((id, status)) => {
                    tracing::info!(trigger_id = %trigger_id, process_id = %id, %status, "Trigger started process");
                    started.push(id);
                }
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger_id, "Trigger could not start a process: {e}");
                }
            }
        }
        started
    }
}

/// Build the worker pool from configuration.
///
/// Workers with a `command` run it as an external program; the others
/// interpret flows in-process.
pub fn build_pool(workers: &[WorkerConfig]) -> WorkerPool {
    let mut pool = WorkerPool::new();
    for config in workers {
        let worker: Arc<dyn Worker> = match &config.command {
            Some(command) => Arc::new(CommandWorker::new(command.clone(), config.args.clone())),
            None => Arc::new(ScriptedWorker::new()),
        };
        pool.register(config, worker);
    }
    if pool.is_empty() {
        let local = WorkerConfig {
            id: DEFAULT_WORKER_ID.to_string(),
            capabilities: Default::default(),
            max_concurrency: DEFAULT_WORKER_CONCURRENCY,
            command: None,
            args: Vec::new(),
        };
        pool.register(&local, Arc::new(ScriptedWorker::new()));
    }
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_default_pool_has_local_worker() {
        let pool = build_pool(&[]);
        assert_eq!(pool.len(), 1);
        let lease = pool.acquire(&Map::new()).unwrap().unwrap();
        assert_eq!(lease.worker_id(), DEFAULT_WORKER_ID);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let first = Orchestrator::from_config(config.clone()).await.unwrap();
        let spec = ProcessSpec {
            org: Some("Default".to_string()),
            project: Some("p".to_string()),
            initiator: "alice".to_string(),
            entry_point: Some("main".to_string()),
            definition: Some(serde_json::json!({ "flows": { "main": [{ "log": "hi" }] } })),
            ..Default::default()
        };
        let (id, _) = first.start(spec).await.unwrap();
        first.persist().await;

        let second = Orchestrator::from_config(config).await.unwrap();
        assert!(second.load_state().await.unwrap());
        let process = second.manager().get(id).await.unwrap();
        assert_eq!(process.status, ProcessStatus::Enqueued);
    }
}
