//! Event ingress handlers.
//!
//! POST /event/github            signed GitHub webhook
//! POST /event/external/:name    generic event, payload becomes the attributes

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use fg_core::triggers::github::{parse_github_event, verify_signature};
use fg_protocol::api_models::EventResponse;
use fg_protocol::event_models::InboundEvent;
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
pub const EVENT_TYPE_HEADER: &str = "X-GitHub-Event";

/// GitHub's connectivity check, sent when a webhook is created.
const PING_EVENT: &str = "ping";

pub async fn github_event(
    State(state): State<AppState>,
    query: Result<Query<BTreeMap<String, String>>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EventResponse>, ApiError> {
    let Query(query) = query?;
    let signature = header_value(&headers, SIGNATURE_HEADER);
    verify_signature(
        state.orchestrator.config().github.secret.as_deref(),
        signature,
        &body,
    )?;

    let event_type = header_value(&headers, EVENT_TYPE_HEADER)
        .ok_or_else(|| ApiError::bad_request(format!("missing {EVENT_TYPE_HEADER} header")))?;
    if event_type == PING_EVENT {
        return Ok(Json(EventResponse::default()));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid JSON payload: {e}")))?;
    let event = parse_github_event(event_type, &payload, query)?;
    tracing::info!(
        event_type,
        repository = event.repository.as_deref().unwrap_or("-"),
        branch = event.branch.as_deref().unwrap_or("-"),
        "GitHub event received"
    );

    let instance_ids = state.orchestrator.handle_event(&event).await?;
    Ok(Json(EventResponse { instance_ids }))
}

pub async fn external_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<BTreeMap<String, String>>, QueryRejection>,
    body: Bytes,
) -> Result<Json<EventResponse>, ApiError> {
    let Query(query) = query?;
    let mut event = InboundEvent::new(name);
    event.attributes = attributes_of(&body)?;
    event.query_params = query;
    tracing::info!(source = %event.source, "External event received");

    let instance_ids = state.orchestrator.handle_event(&event).await?;
    Ok(Json(EventResponse { instance_ids }))
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// An empty body carries no attributes; anything else must be a JSON object.
fn attributes_of(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::bad_request("event payload must be a JSON object")),
        Err(e) => Err(ApiError::bad_request(format!("invalid JSON payload: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_of() {
        assert!(attributes_of(b"").unwrap().is_empty());
        assert!(attributes_of(b"  \n").unwrap().is_empty());
        let map = attributes_of(br#"{"job":"deploy"}"#).unwrap();
        assert_eq!(map.get("job"), Some(&Value::from("deploy")));
        assert!(attributes_of(b"[1,2]").is_err());
        assert!(attributes_of(b"{").is_err());
    }
}
