//! Repository and trigger handlers.
//!
//! GET  /trigger?org&project&repo      registered triggers
//! POST /repository/:name/refresh      reload definitions and replace triggers

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use fg_protocol::api_models::RefreshResponse;
use fg_protocol::trigger_models::{Trigger, TriggerQuery};

use crate::error::ApiError;
use crate::AppState;

pub async fn list_triggers(
    State(state): State<AppState>,
    query: Result<Query<TriggerQuery>, QueryRejection>,
) -> Result<Json<Vec<Trigger>>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.orchestrator.triggers().list(&query).await))
}

pub async fn refresh_repository(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let triggers = state.orchestrator.refresh_repository(&name).await?;
    tracing::info!(repository = %name, triggers, "Repository refreshed");
    Ok(Json(RefreshResponse {
        repository: name,
        triggers,
    }))
}
