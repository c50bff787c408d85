//! Cron trigger scheduler.

use crate::triggers::processor::TriggerMatch;
use crate::triggers::registry::TriggerRegistry;
use chrono::{DateTime, Utc};
use ::cron::Schedule;
use fg_protocol::process_models::ProcessSpec;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Event source name of cron triggers.
pub const CRON_SOURCE: &str = "cron";

/// Fires `cron` triggers whose schedule falls between two ticks.
pub struct CronScheduler {
    triggers: Arc<TriggerRegistry>,
    last_tick: Mutex<DateTime<Utc>>,
}

impl CronScheduler {
    /// Create a scheduler; nothing scheduled before `start` fires.
    pub fn new(triggers: Arc<TriggerRegistry>, start: DateTime<Utc>) -> Self {
        Self {
            triggers,
            last_tick: Mutex::new(start),
        }
    }

    /// Fire every cron trigger with a schedule time in `(last_tick, now]`.
    ///
    /// A trigger fires at most once per tick even if several schedule times
    /// were missed. Triggers with a missing or invalid `spec` are skipped.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TriggerMatch> {
        let mut last_tick = self.last_tick.lock().await;
        if now <= *last_tick {
            return Vec::new();
        }
        let since = *last_tick;
        *last_tick = now;
        drop(last_tick);

        let mut fired = Vec::new();
        for candidate in self.triggers.by_source(CRON_SOURCE).await {
            let trigger = &candidate.trigger;
            let Some(expression) = trigger.spec.as_deref() else {
                continue;
            };
            let schedule = match Schedule::from_str(expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(trigger_id = %trigger.id, "Invalid cron spec '{expression}': {e}");
                    continue;
                }
            };
            let due = schedule.after(&since).next().is_some_and(|at| at <= now);
            if !due {
                continue;
            }

            let mut arguments = trigger.arguments.clone();
            arguments.insert(
                "event".to_string(),
                json!({ "spec": expression, "fireAt": now.to_rfc3339() }),
            );
            let spec = ProcessSpec {
                org: Some(trigger.org.clone()),
                project: Some(trigger.project.clone()),
                repo: Some(trigger.repo.clone()),
                initiator: CRON_SOURCE.to_string(),
                entry_point: Some(trigger.entry_point.clone()),
                arguments,
                exclusive: trigger.exclusive.clone(),
                event_attributes: [("spec".to_string(), Value::from(expression))]
                    .into_iter()
                    .collect(),
                created_at: Some(now),
                ..Default::default()
            };
            fired.push(TriggerMatch {
                trigger: trigger.clone(),
                spec,
            });
        }
        fired
    }
}
