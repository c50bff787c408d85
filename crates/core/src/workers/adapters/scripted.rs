//! In-process worker that interprets flow step lists.
//!
//! A flow is a list of single-key maps under `flows.<entryPoint>` of the
//! process definition:
//!
//! ```yaml
//! flows:
//!   main:
//!     - log: "Hello, ${name}"
//!     - checkpoint: first
//!     - lock: deploy            # or { name: deploy, scope: org }
//!     - form: approval
//!     - output: { result: "${approved}" }
//!     - unlock: deploy
//! ```
//!
//! The execution cursor is `{ "step": <next step>, "vars": {...} }`. Variables
//! start from the process arguments, are overlaid with the cursor's variables
//! and then with the resume payload's data.

use crate::workers::base::{Job, LockScope, Worker, WorkerError, WorkerEvent, WorkerStream};
use async_trait::async_trait;
use fg_protocol::process_models::AwaitedCondition;
use serde_json::{json, Map, Value};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct ScriptedWorker;

impl ScriptedWorker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn check_availability(&self) -> bool {
        true
    }

    async fn execute(&self, job: &Job) -> Result<WorkerStream, WorkerError> {
        let steps = match flow_steps(job) {
            Ok(steps) => steps,
            Err(error) => {
                let stream = tokio_stream::iter(vec![Ok(WorkerEvent::Failed { error })]);
                return Ok(Box::pin(stream));
            }
        };
        let (start, mut vars) = initial_state(job);

        let stream = async_stream::stream! {
            for (index, step) in steps.iter().enumerate().skip(start) {
                let cursor = |vars: &Map<String, Value>| json!({ "step": index + 1, "vars": vars });

                let (op, arg) = match single_entry(step) {
                    Some(entry) => entry,
                    None => {
                        yield Ok(WorkerEvent::Failed {
                            error: format!("step {index}: expected a single-key map"),
                        });
                        return;
                    }
                };

                match op {
                    "log" => yield Ok(WorkerEvent::log(interpolate(&text(arg), &vars))),
                    "checkpoint" => yield Ok(WorkerEvent::Checkpoint {
                        name: text(arg),
                        snapshot: cursor(&vars),
                    }),
                    "output" => {
                        if let Some(values) = arg.as_object() {
                            for (key, value) in values {
                                vars.insert(key.clone(), interpolate_value(value, &vars));
                            }
                        }
                    }
                    "setMeta" => {
                        if let Some(values) = arg.as_object() {
                            for (key, value) in values {
                                yield Ok(WorkerEvent::Meta {
                                    key: key.clone(),
                                    value: interpolate_value(value, &vars),
                                });
                            }
                        }
                    }
                    "form" => {
                        yield Ok(WorkerEvent::Suspend {
                            condition: AwaitedCondition::Form { form_id: text(arg) },
                            snapshot: cursor(&vars),
                        });
                        return;
                    }
                    "event" => {
                        yield Ok(WorkerEvent::Suspend {
                            condition: AwaitedCondition::Event { name: text(arg) },
                            snapshot: cursor(&vars),
                        });
                        return;
                    }
                    "lock" => {
                        let (scope, key) = lock_target(arg);
                        yield Ok(WorkerEvent::AcquireLock { scope, key, snapshot: cursor(&vars) });
                    }
                    "unlock" => {
                        let (scope, key) = lock_target(arg);
                        yield Ok(WorkerEvent::ReleaseLock { scope, key });
                    }
                    "sleep" => {
                        let ms = arg.as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    "fail" => {
                        yield Ok(WorkerEvent::Failed { error: interpolate(&text(arg), &vars) });
                        return;
                    }
                    other => {
                        yield Ok(WorkerEvent::Failed {
                            error: format!("step {index}: unknown step '{other}'"),
                        });
                        return;
                    }
                }
            }

            yield Ok(WorkerEvent::Finished { out: vars });
        };

        Ok(Box::pin(stream))
    }
}

fn flow_steps(job: &Job) -> Result<Vec<Value>, String> {
    let flow = job
        .definition
        .as_ref()
        .and_then(|d| d.get("flows"))
        .and_then(|f| f.get(&job.entry_point));
    match flow {
        Some(Value::Array(steps)) => Ok(steps.clone()),
        Some(_) => Err(format!("flow '{}' is not a list of steps", job.entry_point)),
        None => Err(format!("flow '{}' not found", job.entry_point)),
    }
}

fn initial_state(job: &Job) -> (usize, Map<String, Value>) {
    let mut vars = job.arguments.clone();
    let mut start = 0;
    if let Some(snapshot) = &job.snapshot {
        start = snapshot.get("step").and_then(Value::as_u64).unwrap_or(0) as usize;
        if let Some(saved) = snapshot.get("vars").and_then(Value::as_object) {
            vars.extend(saved.clone());
        }
    }
    if let Some(payload) = &job.resume_payload {
        vars.extend(payload.data.clone());
    }
    (start, vars)
}

fn single_entry(step: &Value) -> Option<(&str, &Value)> {
    let map = step.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.iter().next().map(|(k, v)| (k.as_str(), v))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lock_target(arg: &Value) -> (LockScope, String) {
    match arg {
        Value::Object(map) => {
            let scope = map
                .get("scope")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
                .unwrap_or_default();
            let key = map.get("name").map(text).unwrap_or_default();
            (scope, key)
        }
        other => (LockScope::default(), text(other)),
    }
}

/// Resolve a dotted variable path (`event.branch`).
fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut value = vars.get(parts.next()?)?;
    for part in parts {
        value = value.get(part)?;
    }
    Some(value)
}

/// Replace `${name}` with the variable's value. Unknown names expand to "".
fn interpolate(template: &str, vars: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                if let Some(value) = lookup(vars, after[..end].trim()) {
                    out.push_str(&text(value));
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn interpolate_value(value: &Value, vars: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
