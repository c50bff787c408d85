//! Test fixtures for creating sample configurations and test data.

use fg_core::Orchestrator;
use fg_protocol::config_models::{RepositoryConfig, ServerConfig};
use fg_protocol::process_models::ProcessSpec;
use serde_json::{json, Value};
use std::path::Path;
use tempfile::TempDir;

/// Create a temporary repository checkout containing `flowgate.yml`.
///
/// Returns a TempDir that must be kept alive for the test duration.
#[allow(dead_code)]
pub fn create_checkout(definition_yaml: &str) -> std::io::Result<TempDir> {
    let temp_dir = tempfile::tempdir()?;
    std::fs::write(temp_dir.path().join("flowgate.yml"), definition_yaml)?;
    Ok(temp_dir)
}

/// A repository registration pointing at a local checkout.
#[allow(dead_code)]
pub fn repository(project: &str, name: &str, url: &str, path: &Path) -> RepositoryConfig {
    RepositoryConfig {
        org: "Default".to_string(),
        project: project.to_string(),
        name: name.to_string(),
        url: url.to_string(),
        branch: None,
        path: Some(path.to_path_buf()),
    }
}

/// Build an in-memory orchestrator.
#[allow(dead_code)]
pub async fn orchestrator(config: ServerConfig) -> Orchestrator {
    Orchestrator::from_config(config)
        .await
        .expect("orchestrator should build")
}

/// A start spec carrying an inline definition with a single `main` flow.
#[allow(dead_code)]
pub fn flow_spec(steps: Value) -> ProcessSpec {
    ProcessSpec {
        org: Some("Default".to_string()),
        project: Some("p".to_string()),
        initiator: "alice".to_string(),
        entry_point: Some("main".to_string()),
        definition: Some(json!({ "flows": { "main": steps } })),
        ..Default::default()
    }
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
