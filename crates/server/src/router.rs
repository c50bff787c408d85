//! Router construction for the flowgate server.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::AppState;

/// Build the full axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/process", post(handlers::process::start_process))
        .route("/process/:id", get(handlers::process::get_process))
        .route("/process/:id/log", get(handlers::process::get_log))
        .route(
            "/process/:id/checkpoint",
            get(handlers::process::list_checkpoints),
        )
        .route("/process/:id/resume", post(handlers::process::resume_process))
        .route("/process/:id/kill", post(handlers::process::kill_process))
        .route(
            "/process/:id/restore",
            post(handlers::process::restore_process),
        )
        .route("/trigger", get(handlers::repository::list_triggers))
        .route("/event/github", post(handlers::events::github_event))
        .route(
            "/event/external/:name",
            post(handlers::events::external_event),
        )
        .route(
            "/repository/:name/refresh",
            post(handlers::repository::refresh_repository),
        )
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
