//! Custom assertion helpers for integration tests.

use fg_core::Orchestrator;
use fg_protocol::ipc::Event;
use fg_protocol::process_models::{ProcessInstance, ProcessStatus};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Number of log lines of a process equal to `line`.
#[allow(dead_code)]
pub fn count_lines(process: &ProcessInstance, line: &str) -> usize {
    process.logs.iter().filter(|e| e.line == line).count()
}

/// Assert the current status of a process.
#[allow(dead_code)]
pub async fn assert_status(orchestrator: &Orchestrator, id: Uuid, expected: ProcessStatus) {
    let process = orchestrator
        .manager()
        .get(id)
        .await
        .expect("process should exist");
    assert_eq!(
        process.status, expected,
        "process {id} logs: {:?}",
        process.log_lines()
    );
}

/// Drain every event already broadcast.
#[allow(dead_code)]
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Assert that a sequence of events contains a ProcessStatusUpdate with specific status.
#[allow(dead_code)]
pub fn assert_has_status_update(events: &[Event], id: Uuid, status: ProcessStatus) -> bool {
    events.iter().any(|e| {
        matches!(
            e,
            Event::ProcessStatusUpdate {
                process_id,
                status: s,
            } if *process_id == id && *s == status
        )
    })
}
