//! JSON snapshots of the core state.
//!
//! The snapshot is written atomically (temp file + rename) to
//! `<data_dir>/state.json`. At startup the registries are repopulated from it
//! and reconciled against the stored instances.

use crate::error::{CoreError, CoreResult};
use fg_protocol::checkpoint_models::Checkpoint;
use fg_protocol::process_models::ProcessInstance;
use fg_protocol::repository_models::{Repository, RepositoryDefinition};
use fg_protocol::trigger_models::Trigger;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the snapshot inside the data directory.
pub const SNAPSHOT_FILE: &str = "state.json";

/// A repository definition together with its owning repository.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredDefinition {
    pub org: String,
    pub project: String,
    pub repo: String,
    pub definition: RepositoryDefinition,
}

/// Everything the core needs to resume after a restart.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub processes: Vec<ProcessInstance>,
    pub checkpoints: Vec<Checkpoint>,
    pub repositories: Vec<Repository>,
    pub definitions: Vec<StoredDefinition>,
    pub triggers: Vec<Trigger>,
}

fn snapshot_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SNAPSHOT_FILE)
}

/// Write the snapshot atomically.
///
/// # Errors
///
/// Returns `Persistence` if the directory cannot be created or the file
/// cannot be written.
pub fn save(data_dir: &Path, state: &PersistedState) -> CoreResult<()> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| CoreError::Persistence(format!("{}: {e}", data_dir.display())))?;

    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| CoreError::Persistence(format!("serialize snapshot: {e}")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(data_dir)
        .map_err(|e| CoreError::Persistence(format!("create temp file: {e}")))?;
    tmp.write_all(&json)
        .map_err(|e| CoreError::Persistence(format!("write snapshot: {e}")))?;
    tmp.persist(snapshot_path(data_dir))
        .map_err(|e| CoreError::Persistence(format!("persist snapshot: {e}")))?;

    Ok(())
}

/// Read the snapshot, if one exists.
pub fn load(data_dir: &Path) -> CoreResult<Option<PersistedState>> {
    let path = snapshot_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read(&path)
        .map_err(|e| CoreError::Persistence(format!("{}: {e}", path.display())))?;
    let state = serde_json::from_slice(&content)
        .map_err(|e| CoreError::Persistence(format!("{}: {e}", path.display())))?;

    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_without_snapshot() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let state = PersistedState {
            definitions: vec![StoredDefinition {
                org: "Default".to_string(),
                project: "app".to_string(),
                repo: "app".to_string(),
                definition: RepositoryDefinition::default(),
            }],
            ..Default::default()
        };

        save(&dir.path().join("nested"), &state).unwrap();
        let loaded = load(&dir.path().join("nested")).unwrap().unwrap();

        assert_eq!(loaded.definitions, state.definitions);
        assert!(loaded.processes.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SNAPSHOT_FILE), "{ not json").unwrap();
        assert!(matches!(load(dir.path()), Err(CoreError::Persistence(_))));
    }
}
