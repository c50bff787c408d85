//! Process state machine.
//!
//! Pure functions over a [`ProcessInstance`]: construction, guarded status
//! transitions and the resume decision. Nothing here touches shared state;
//! the [`StateManager`](crate::state::manager::StateManager) applies these
//! functions inside store updates.

use crate::error::{CoreError, CoreResult};
use crate::exclusive::resolve_key;
use chrono::Utc;
use fg_protocol::process_models::{
    AwaitedCondition, LogEntry, ProcessInstance, ProcessSpec, ProcessStatus, ResumePayload,
    StatusChange,
};
use uuid::Uuid;

/// Create a NEW instance from a start specification.
///
/// # Arguments
///
/// * `spec` - The start specification
/// * `entry_point` - Resolved entry point
///
/// # Returns
///
/// An instance with a fresh id, status NEW and its exclusive key resolved
/// from the spec's event attributes.
pub fn new_instance(spec: &ProcessSpec, entry_point: String) -> ProcessInstance {
    let now = Utc::now();
    let created_at = spec.created_at.unwrap_or(now);
    let exclusive = spec.exclusive.as_ref().map(|e| {
        resolve_key(
            e,
            spec.org.as_deref(),
            spec.project.as_deref(),
            &spec.event_attributes,
        )
    });

    ProcessInstance {
        id: Uuid::new_v4(),
        status: ProcessStatus::New,
        org: spec.org.clone(),
        project: spec.project.clone(),
        repo: spec.repo.clone(),
        initiator: spec.initiator.clone(),
        parent_id: spec.parent_id,
        kind: spec.kind,
        entry_point,
        arguments: spec.arguments.clone(),
        exclusive,
        meta: spec.meta.clone(),
        requirements: spec.requirements.clone(),
        handlers: spec.handlers.clone(),
        timeout_secs: spec.timeout_secs,
        suspend_timeout_secs: spec.suspend_timeout_secs,
        out_variables: spec.out_variables.clone(),
        dependencies: spec.dependencies.clone(),
        awaiting: None,
        held_locks: Vec::new(),
        worker_id: None,
        snapshot: None,
        resume_payload: None,
        definition: spec.definition.clone(),
        children_ids: Vec::new(),
        status_history: vec![StatusChange {
            status: ProcessStatus::New,
            at: created_at,
        }],
        logs: Vec::new(),
        created_at,
        last_updated_at: now,
        running_since: None,
        seq: 0,
    }
}

/// Move an instance along an edge of the state graph.
///
/// Records the change in the status history and stamps `running_since` on
/// the first RUNNING.
///
/// # Errors
///
/// Returns `InvalidTransition` if the graph has no such edge.
pub fn transition(process: &mut ProcessInstance, to: ProcessStatus) -> CoreResult<()> {
    if !process.status.can_transition_to(to) {
        return Err(CoreError::InvalidTransition {
            id: process.id,
            from: process.status,
            to,
        });
    }
    apply_status(process, to);
    Ok(())
}

/// Take the checkpoint-restore edge into RESUMING.
///
/// # Errors
///
/// Returns `RestoreNotAllowed` unless the instance is terminal or SUSPENDED.
pub fn restore_transition(process: &mut ProcessInstance) -> CoreResult<()> {
    if !process.status.is_restorable() {
        return Err(CoreError::RestoreNotAllowed(process.status));
    }
    apply_status(process, ProcessStatus::Resuming);
    Ok(())
}

fn apply_status(process: &mut ProcessInstance, to: ProcessStatus) {
    let now = Utc::now();
    if to == ProcessStatus::Running && process.running_since.is_none() {
        process.running_since = Some(now);
    }
    process.status = to;
    process.last_updated_at = now;
    process.status_history.push(StatusChange { status: to, at: now });
}

/// Decide whether a payload resumes an instance.
///
/// # Returns
///
/// `Ok(())` if the instance is SUSPENDED on a form or event answered by the
/// payload, otherwise the reason it is not resumable.
pub fn check_resume(
    status: ProcessStatus,
    awaiting: Option<&AwaitedCondition>,
    payload: &ResumePayload,
) -> Result<(), String> {
    if status != ProcessStatus::Suspended {
        return Err(format!("process is {status}"));
    }
    match awaiting {
        None => Err("process is not waiting for input".to_string()),
        Some(AwaitedCondition::Form { form_id }) if *form_id == payload.event => Ok(()),
        Some(AwaitedCondition::Event { name }) if *name == payload.event => Ok(()),
        Some(condition) if condition.is_internal() => {
            Err(format!("process is {}", condition.reason()))
        }
        Some(condition) => Err(format!(
            "process is {}, got '{}'",
            condition.reason(),
            payload.event
        )),
    }
}

/// Append a log line to an instance.
pub fn log_line(process: &mut ProcessInstance, line: impl Into<String>) -> LogEntry {
    let entry = LogEntry {
        at: Utc::now(),
        line: line.into(),
    };
    process.logs.push(entry.clone());
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_protocol::process_models::ExclusiveMode;
    use fg_protocol::repository_models::ExclusiveSpec;
    use serde_json::json;

    fn instance() -> ProcessInstance {
        new_instance(&ProcessSpec::default(), "main".to_string())
    }

    #[test]
    fn test_new_instance() {
        let spec = ProcessSpec {
            org: Some("Default".to_string()),
            project: Some("p".to_string()),
            exclusive: Some(ExclusiveSpec {
                group: "RED".to_string(),
                mode: ExclusiveMode::Wait,
                group_by_branch: true,
                group_by_event_attr: None,
            }),
            event_attributes: json!({ "branch": "dev" }).as_object().cloned().unwrap(),
            ..Default::default()
        };
        let process = new_instance(&spec, "main".to_string());

        assert_eq!(process.status, ProcessStatus::New);
        assert_eq!(process.status_history.len(), 1);
        let key = process.exclusive.unwrap();
        assert_eq!(key.scope, "Default/p#branch=dev");
        assert_eq!(key.mode, ExclusiveMode::Wait);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut process = instance();
        for status in [
            ProcessStatus::Preparing,
            ProcessStatus::Enqueued,
            ProcessStatus::Starting,
            ProcessStatus::Running,
            ProcessStatus::Suspended,
            ProcessStatus::Resuming,
            ProcessStatus::Running,
            ProcessStatus::Finished,
        ] {
            transition(&mut process, status).unwrap();
        }
        assert_eq!(process.status_history.len(), 9);
        assert!(process.running_since.is_some());
        assert!(process.has_started());
    }

    #[test]
    fn test_running_since_is_first_running() {
        let mut process = instance();
        for status in [
            ProcessStatus::Preparing,
            ProcessStatus::Enqueued,
            ProcessStatus::Starting,
            ProcessStatus::Running,
        ] {
            transition(&mut process, status).unwrap();
        }
        let first = process.running_since;
        transition(&mut process, ProcessStatus::Suspended).unwrap();
        transition(&mut process, ProcessStatus::Resuming).unwrap();
        transition(&mut process, ProcessStatus::Running).unwrap();
        assert_eq!(process.running_since, first);
    }

    #[test]
    fn test_invalid_transition_leaves_instance_untouched() {
        let mut process = instance();
        let err = transition(&mut process, ProcessStatus::Running).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(process.status, ProcessStatus::New);
        assert_eq!(process.status_history.len(), 1);
    }

    #[test]
    fn test_restore_transition() {
        let mut process = instance();
        assert!(matches!(
            restore_transition(&mut process),
            Err(CoreError::RestoreNotAllowed(ProcessStatus::New))
        ));

        transition(&mut process, ProcessStatus::Cancelled).unwrap();
        restore_transition(&mut process).unwrap();
        assert_eq!(process.status, ProcessStatus::Resuming);
    }

    #[test]
    fn test_check_resume() {
        let form = AwaitedCondition::Form {
            form_id: "approval".to_string(),
        };
        let payload = |event: &str| ResumePayload {
            event: event.to_string(),
            ..Default::default()
        };

        assert!(check_resume(ProcessStatus::Suspended, Some(&form), &payload("approval")).is_ok());
        assert!(check_resume(ProcessStatus::Suspended, Some(&form), &payload("other")).is_err());
        assert!(check_resume(ProcessStatus::Running, Some(&form), &payload("approval")).is_err());
        assert!(check_resume(ProcessStatus::Suspended, None, &payload("approval")).is_err());

        let lock = AwaitedCondition::Lock {
            scope: "org:o".to_string(),
            key: "k".to_string(),
        };
        let reason = check_resume(ProcessStatus::Suspended, Some(&lock), &payload("k")).unwrap_err();
        assert!(reason.contains("waiting-on-lock"));
    }
}
