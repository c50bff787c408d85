//! GitHub webhook support.
//!
//! Signature verification (`X-Hub-Signature: sha1=<hex>`) and translation of
//! a webhook payload into an [`InboundEvent`].

use crate::error::{CoreError, CoreResult};
use fg_protocol::event_models::InboundEvent;
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha1::Sha1;
use std::collections::{BTreeMap, BTreeSet};

type HmacSha1 = Hmac<Sha1>;

/// Event source name of GitHub triggers.
pub const GITHUB_SOURCE: &str = "github";

const SIGNATURE_PREFIX: &str = "sha1=";
const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Compute the `X-Hub-Signature` header value for a body.
///
/// # Errors
///
/// Returns `InvalidSignature` if the secret cannot be used as an HMAC key.
pub fn compute_signature(secret: &str, body: &[u8]) -> CoreResult<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
    mac.update(body);
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Verify a webhook signature against the raw request body.
///
/// # Arguments
///
/// * `secret` - Configured webhook secret; `None` rejects every request
/// * `header` - Value of `X-Hub-Signature`, if present
/// * `body` - Raw request body, exactly as received
///
/// # Errors
///
/// Returns `InvalidSignature` if no secret is configured, the header is
/// missing or malformed, or the digest does not match.
pub fn verify_signature(secret: Option<&str>, header: Option<&str>, body: &[u8]) -> CoreResult<()> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::InvalidSignature("webhook secret is not configured".to_string()))?;
    let header =
        header.ok_or_else(|| CoreError::InvalidSignature("missing signature header".to_string()))?;
    let digest = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| CoreError::InvalidSignature("unsupported signature format".to_string()))?;
    let expected = hex::decode(digest)
        .map_err(|_| CoreError::InvalidSignature("signature is not hex encoded".to_string()))?;

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::InvalidSignature(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| CoreError::InvalidSignature("signature mismatch".to_string()))
}

/// Translate a GitHub webhook payload into an inbound event.
///
/// # Arguments
///
/// * `event_type` - Value of `X-GitHub-Event` (`push`, `pull_request`, ...)
/// * `payload` - Parsed JSON body
/// * `query` - Query parameters of the webhook request
///
/// # Errors
///
/// Returns `Validation` if the payload is not a JSON object.
pub fn parse_github_event(
    event_type: &str,
    payload: &Value,
    query: BTreeMap<String, String>,
) -> CoreResult<InboundEvent> {
    let body = payload
        .as_object()
        .ok_or_else(|| CoreError::Validation("github payload must be a JSON object".to_string()))?;

    let mut event = InboundEvent::new(GITHUB_SOURCE);
    event.query_params = query;
    event.deleted_ref = body.get("deleted").and_then(Value::as_bool).unwrap_or(false);

    let full_name = payload
        .pointer("/repository/full_name")
        .and_then(Value::as_str);
    let branch = branch_of(event_type, payload);
    event.repository = full_name.map(str::to_string);
    event.branch = branch;

    event.author = payload
        .pointer("/sender/login")
        .or_else(|| payload.pointer("/pusher/name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut attributes = Map::new();
    attributes.insert("type".to_string(), json!(event_type));
    if let Some(action) = body.get("action").and_then(Value::as_str) {
        attributes.insert("status".to_string(), json!(action));
    }
    if let Some(commit_id) = commit_id_of(event_type, payload) {
        attributes.insert("commitId".to_string(), json!(commit_id));
    }
    if let Some(sender) = &event.author {
        attributes.insert("sender".to_string(), json!(sender));
    }

    let files = changed_files(event_type, payload);
    event.empty = event_type == "push" && !event.deleted_ref && files.is_empty();
    attributes.insert("files".to_string(), files.into_value());
    attributes.insert("payload".to_string(), payload.clone());
    event.attributes = attributes;

    Ok(event)
}

fn branch_of(event_type: &str, payload: &Value) -> Option<String> {
    let raw = match event_type {
        "push" | "create" | "delete" => payload.get("ref").and_then(Value::as_str),
        "pull_request" | "pull_request_review" | "pull_request_review_comment" => payload
            .pointer("/pull_request/base/ref")
            .and_then(Value::as_str),
        _ => None,
    }?;
    Some(raw.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(raw).to_string())
}

fn commit_id_of(event_type: &str, payload: &Value) -> Option<String> {
    let id = match event_type {
        "push" => payload.get("after"),
        "pull_request" => payload.pointer("/pull_request/head/sha"),
        _ => None,
    }?;
    id.as_str().map(str::to_string)
}

#[derive(Default)]
struct ChangedFiles {
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
    modified: BTreeSet<String>,
}

impl ChangedFiles {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    fn into_value(self) -> Value {
        let any: BTreeSet<String> = self
            .added
            .iter()
            .chain(&self.removed)
            .chain(&self.modified)
            .cloned()
            .collect();
        json!({
            "added": self.added,
            "removed": self.removed,
            "modified": self.modified,
            "any": any,
        })
    }
}

fn changed_files(event_type: &str, payload: &Value) -> ChangedFiles {
    let mut files = ChangedFiles::default();
    if event_type != "push" {
        return files;
    }
    let commits = payload
        .get("commits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for commit in commits {
        for (key, set) in [
            ("added", &mut files.added),
            ("removed", &mut files.removed),
            ("modified", &mut files.modified),
        ] {
            let paths = commit.get(key).and_then(Value::as_array);
            set.extend(paths.into_iter().flatten().filter_map(|p| p.as_str().map(str::to_string)));
        }
    }
    files
}
