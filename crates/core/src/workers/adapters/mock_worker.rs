//! Mock worker implementation for testing.

use crate::workers::base::{Job, Worker, WorkerError, WorkerEvent, WorkerStream};
use async_trait::async_trait;
use serde_json::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Replays a fixed list of events for every job.
#[derive(Clone)]
pub struct MockWorker {
    available: bool,
    events: Vec<Result<WorkerEvent, WorkerError>>,
    executions: Arc<AtomicUsize>,
}

impl MockWorker {
    pub fn new(available: bool, events: Vec<Result<WorkerEvent, WorkerError>>) -> Self {
        Self {
            available,
            events,
            executions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn success() -> Self {
        Self::new(
            true,
            vec![
                Ok(WorkerEvent::log("Mock worker running")),
                Ok(WorkerEvent::Finished { out: Map::new() }),
            ],
        )
    }

    pub fn unavailable() -> Self {
        Self::new(false, vec![])
    }

    pub fn failing() -> Self {
        Self::new(
            true,
            vec![
                Ok(WorkerEvent::log("Starting...")),
                Err(WorkerError::Execution("Mock failure".to_string())),
            ],
        )
    }

    /// Number of `execute` calls so far, across clones.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn check_availability(&self) -> bool {
        self.available
    }

    async fn execute(&self, _job: &Job) -> Result<WorkerStream, WorkerError> {
        if !self.available {
            return Err(WorkerError::Unavailable("Mock worker not available".to_string()));
        }
        self.executions.fetch_add(1, Ordering::SeqCst);

        let events = self.events.clone();
        let stream = tokio_stream::iter(events);
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn job() -> Job {
        Job {
            process_id: Uuid::new_v4(),
            entry_point: "main".to_string(),
            arguments: Map::new(),
            definition: None,
            snapshot: None,
            resume_payload: None,
        }
    }

    #[tokio::test]
    async fn test_mock_worker_success() {
        let worker = MockWorker::success();
        assert!(worker.check_availability().await);

        let stream = worker.execute(&job()).await.unwrap();
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(WorkerEvent::Log { .. })));
        assert!(matches!(events[1], Ok(WorkerEvent::Finished { .. })));
        assert_eq!(worker.executions(), 1);
    }

    #[tokio::test]
    async fn test_mock_worker_unavailable() {
        let worker = MockWorker::unavailable();
        assert!(!worker.check_availability().await);

        let result = worker.execute(&job()).await;
        assert!(matches!(result, Err(WorkerError::Unavailable(_))));
        assert_eq!(worker.executions(), 0);
    }

    #[tokio::test]
    async fn test_mock_worker_failing() {
        let worker = MockWorker::failing();
        let stream = worker.execute(&job()).await.unwrap();
        let events: Vec<_> = stream.collect().await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(WorkerError::Execution(_))));
    }
}
