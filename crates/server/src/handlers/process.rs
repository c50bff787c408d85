//! Process handlers.
//!
//! POST /process                  start a process
//! GET  /process/:id              process status and metadata
//! GET  /process/:id/log          log lines
//! GET  /process/:id/checkpoint   checkpoints, oldest first
//! POST /process/:id/resume       answer a form or awaited event
//! POST /process/:id/kill         cancel the process
//! POST /process/:id/restore      rewind to a checkpoint

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use fg_protocol::api_models::{ProcessEntry, RestoreRequest, StartProcessRequest, StartProcessResponse};
use fg_protocol::checkpoint_models::CheckpointEntry;
use fg_protocol::process_models::{LogEntry, ProcessSpec, ResumePayload};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// Initiator recorded when the request names none.
const ANONYMOUS: &str = "anonymous";

pub async fn start_process(
    State(state): State<AppState>,
    payload: Result<Json<StartProcessRequest>, JsonRejection>,
) -> Result<Json<StartProcessResponse>, ApiError> {
    let Json(request) = payload?;
    let (instance_id, status) = state.orchestrator.start(into_spec(request)).await?;
    Ok(Json(StartProcessResponse {
        instance_id,
        status,
    }))
}

pub async fn get_process(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessEntry>, ApiError> {
    let process = state.orchestrator.manager().get(id).await?;
    Ok(Json(ProcessEntry::from(&process)))
}

pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    Ok(Json(state.orchestrator.manager().logs(id).await?))
}

pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CheckpointEntry>>, ApiError> {
    let checkpoints = state.orchestrator.manager().checkpoints(id).await?;
    Ok(Json(checkpoints.iter().map(CheckpointEntry::from).collect()))
}

pub async fn resume_process(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ResumePayload>, JsonRejection>,
) -> Result<Json<ProcessEntry>, ApiError> {
    let Json(resume) = payload?;
    let manager = state.orchestrator.manager();
    manager.resume(id, resume).await?;
    Ok(Json(ProcessEntry::from(&manager.get(id).await?)))
}

pub async fn kill_process(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessEntry>, ApiError> {
    let manager = state.orchestrator.manager();
    manager.kill(id).await?;
    Ok(Json(ProcessEntry::from(&manager.get(id).await?)))
}

pub async fn restore_process(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> Result<Json<ProcessEntry>, ApiError> {
    let Json(request) = payload?;
    let manager = state.orchestrator.manager();
    manager.restore_checkpoint(id, request.checkpoint_id).await?;
    Ok(Json(ProcessEntry::from(&manager.get(id).await?)))
}

fn into_spec(request: StartProcessRequest) -> ProcessSpec {
    ProcessSpec {
        org: request.org,
        project: request.project,
        repo: request.repo,
        initiator: request
            .initiator
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| ANONYMOUS.to_string()),
        parent_id: request.parent_instance_id,
        entry_point: request.entry_point,
        arguments: request.arguments,
        exclusive: request.exclusive,
        requirements: request.requirements,
        meta: request.meta,
        archive: request.archive,
        ..Default::default()
    }
}
