//! Shared helpers for the HTTP tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use fg_core::Orchestrator;
use fg_protocol::config_models::ServerConfig;
use fg_server::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Build the router on top of a fresh orchestrator.
#[allow(dead_code)]
pub async fn app(config: ServerConfig) -> (Router, Arc<Orchestrator>) {
    let orchestrator = Arc::new(
        Orchestrator::from_config(config)
            .await
            .expect("orchestrator should build"),
    );
    (build_router(AppState::new(Arc::clone(&orchestrator))), orchestrator)
}

/// Send a request and decode the JSON response body.
#[allow(dead_code)]
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should be readable")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response should be JSON")
    };
    (status, body)
}

#[allow(dead_code)]
pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request should build")
}

#[allow(dead_code)]
pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request should build")
}

/// Dispatch until no runnable instance is left, awaiting every execution.
#[allow(dead_code)]
pub async fn run_until_idle(orchestrator: &Orchestrator) {
    for _ in 0..50 {
        let handles = orchestrator.dispatcher().poll_once().await;
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            handle.await.expect("execution task should not panic");
        }
    }
    panic!("dispatcher did not become idle");
}

/// Log lines of a process as returned by `GET /process/:id/log`.
#[allow(dead_code)]
pub async fn log_lines(app: &Router, id: &str) -> Vec<String> {
    let (status, body) = send(app, get(&format!("/process/{id}/log"))).await;
    assert_eq!(status, StatusCode::OK);
    body.as_array()
        .expect("log should be an array")
        .iter()
        .filter_map(|entry| entry["line"].as_str().map(str::to_string))
        .collect()
}
