//! Configuration file loader.
//!
//! This module provides functionality to load and parse:
//! - `flowgate.toml`: server settings, repositories, workers and policy
//! - `flowgate.yml` and `flowgate/*.yml`: repository definitions, either from
//!   a checkout on disk or from the entries of an uploaded archive

use crate::config::error::ConfigError;
use crate::config::error::ConfigResult;
use fg_protocol::config_models::ServerConfig;
use fg_protocol::process_models::ArchiveEntry;
use fg_protocol::repository_models::RepositoryDefinition;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Root definition file of a repository.
pub const DEFINITION_FILE: &str = "flowgate.yml";

/// Directory holding definition fragments.
pub const FRAGMENT_DIR: &str = "flowgate";

/// Environment variable overriding `[github] secret`.
pub const GITHUB_SECRET_ENV: &str = "FLOWGATE_GITHUB_SECRET";

/// Loads the server configuration from a TOML file.
///
/// # Arguments
///
/// * `path` - Path to `flowgate.toml`
///
/// # Returns
///
/// The parsed `ServerConfig`. If the file does not exist, the default
/// configuration is returned rather than an error.
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - The file exists but cannot be read
/// - The file has invalid TOML syntax
/// - Worker ids or repository names are duplicated
///
/// # Example
///
/// ```rust,no_run
/// use fg_core::config::loader::load_server_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_server_config(Path::new("flowgate.toml")).await?;
/// println!("Listening on {}", config.server.bind);
/// # Ok(())
/// # }
/// ```
pub async fn load_server_config(path: &Path) -> ConfigResult<ServerConfig> {
    if !path.exists() {
        return Ok(ServerConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: ServerConfig = toml::from_str(&content).map_err(|source| ConfigError::ServerToml {
        path: path.to_path_buf(),
        source,
    })?;

    validate_server_config(path, &config)?;

    Ok(config)
}

/// Applies environment overrides to a loaded configuration.
///
/// `lookup` resolves an environment variable name; pass
/// `|k| std::env::var(k).ok()` in production.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(secret) = lookup(GITHUB_SECRET_ENV).filter(|s| !s.is_empty()) {
        config.github.secret = Some(secret);
    }
}

fn validate_server_config(path: &Path, config: &ServerConfig) -> ConfigResult<()> {
    let mut worker_ids = HashSet::new();
    for worker in &config.workers {
        if worker.max_concurrency == 0 {
            return Err(ConfigError::ServerRule {
                path: path.to_path_buf(),
                reason: format!("worker '{}' has max_concurrency = 0", worker.id),
            });
        }
        if !worker_ids.insert(worker.id.as_str()) {
            return Err(ConfigError::ServerRule {
                path: path.to_path_buf(),
                reason: format!("duplicate worker id '{}'", worker.id),
            });
        }
    }

    let mut repos = HashSet::new();
    for repo in &config.repositories {
        let key = (repo.org.as_str(), repo.project.as_str(), repo.name.as_str());
        if !repos.insert(key) {
            return Err(ConfigError::ServerRule {
                path: path.to_path_buf(),
                reason: format!(
                    "duplicate repository '{}/{}/{}'",
                    repo.org, repo.project, repo.name
                ),
            });
        }
    }

    Ok(())
}

/// Loads a repository definition from a checkout directory.
///
/// Reads `flowgate.yml` (if present) and merges every `flowgate/*.yml`
/// fragment on top of it, in file name order.
///
/// # Arguments
///
/// * `root` - Directory containing `flowgate.yml`
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - The directory does not exist
/// - A file cannot be read or has invalid YAML syntax
pub async fn load_repository_definition(root: &Path) -> ConfigResult<RepositoryDefinition> {
    if !root.is_dir() {
        return Err(ConfigError::CheckoutNotFound(root.to_path_buf()));
    }

    let mut definition = RepositoryDefinition::default();

    let root_file = root.join(DEFINITION_FILE);
    if root_file.exists() {
        let content = read_file(&root_file)?;
        definition = parse_definition(&root_file, &content)?;
    }

    let fragment_dir = root.join(FRAGMENT_DIR);
    if !fragment_dir.is_dir() {
        return Ok(definition);
    }

    // Walk through all .yml and .yaml files in the fragment directory
    for entry in WalkDir::new(&fragment_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry.map_err(|source| ConfigError::Fragments {
            path: fragment_dir.clone(),
            source,
        })?;

        let path = entry.path();
        if !is_yaml(path) {
            continue;
        }

        let content = read_file(path)?;
        definition.merge(parse_definition(path, &content)?);
    }

    Ok(definition)
}

/// Builds a repository definition from archive entries.
///
/// Uses the same layout as [`load_repository_definition`]: the root
/// `flowgate.yml` first, then `flowgate/*.yml` fragments in path order.
/// Other entries are ignored.
pub fn parse_definition_entries(entries: &[ArchiveEntry]) -> ConfigResult<RepositoryDefinition> {
    let mut definition = RepositoryDefinition::default();

    if let Some(root) = entries.iter().find(|e| e.path == DEFINITION_FILE) {
        definition = parse_definition(Path::new(&root.path), &root.content)?;
    }

    let mut fragments: Vec<&ArchiveEntry> = entries
        .iter()
        .filter(|e| {
            let path = Path::new(&e.path);
            path.parent() == Some(Path::new(FRAGMENT_DIR)) && is_yaml(path)
        })
        .collect();
    fragments.sort_by(|a, b| a.path.cmp(&b.path));

    for fragment in fragments {
        definition.merge(parse_definition(Path::new(&fragment.path), &fragment.content)?);
    }

    Ok(definition)
}

fn parse_definition(path: &Path, content: &str) -> ConfigResult<RepositoryDefinition> {
    if content.trim().is_empty() {
        return Ok(RepositoryDefinition::default());
    }
    serde_yaml::from_str(content).map_err(|source| ConfigError::DefinitionYaml {
        path: PathBuf::from(path),
        source,
    })
}

fn read_file(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn is_yaml(path: &Path) -> bool {
    let ext = path.extension().and_then(|s| s.to_str());
    ext == Some("yml") || ext == Some("yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_server_config_missing_file_returns_default() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = load_server_config(&dir.path().join("flowgate.toml"))
            .await
            .expect("Missing file should not be an error");
        assert_eq!(config, ServerConfig::default());
    }

    #[tokio::test]
    async fn test_load_server_config_rejects_duplicate_workers() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("flowgate.toml");
        fs::write(
            &path,
            "[[workers]]\nid = \"w1\"\n\n[[workers]]\nid = \"w1\"\n",
        )
        .expect("Failed to write config");

        let result = load_server_config(&path).await;
        assert!(matches!(result, Err(ConfigError::ServerRule { .. })));
    }

    #[tokio::test]
    async fn test_load_server_config_invalid_toml() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("flowgate.toml");
        fs::write(&path, "[server\nbind = 1").expect("Failed to write config");

        let result = load_server_config(&path).await;
        assert!(matches!(result, Err(ConfigError::ServerToml { .. })));
    }

    #[test]
    fn test_env_override_sets_github_secret() {
        let mut config = ServerConfig::default();
        apply_env_overrides(&mut config, |key| {
            (key == GITHUB_SECRET_ENV).then(|| "from-env".to_string())
        });
        assert_eq!(config.github.secret.as_deref(), Some("from-env"));

        let mut untouched = ServerConfig::default();
        apply_env_overrides(&mut untouched, |_| Some(String::new()));
        assert!(untouched.github.secret.is_none());
    }

    #[tokio::test]
    async fn test_load_repository_definition_merges_fragments() {
        let dir = tempdir().expect("Failed to create temp dir");
        let root = dir.path();
        fs::create_dir_all(root.join(FRAGMENT_DIR)).expect("Failed to create fragment dir");

        fs::write(
            root.join(DEFINITION_FILE),
            "configuration:\n  entryPoint: main\nflows:\n  main:\n    - log: main\n",
        )
        .expect("Failed to write flowgate.yml");
        fs::write(
            root.join("flowgate/b.yml"),
            "triggers:\n  - github:\n      entryPoint: main\n",
        )
        .expect("Failed to write fragment");
        fs::write(
            root.join("flowgate/a.yml"),
            "flows:\n  other:\n    - log: other\n",
        )
        .expect("Failed to write fragment");
        fs::write(root.join("flowgate/notes.txt"), "ignored").expect("Failed to write txt");

        let definition = load_repository_definition(root)
            .await
            .expect("Definition should load");

        assert_eq!(definition.configuration.entry_point.as_deref(), Some("main"));
        assert_eq!(definition.flows.len(), 2);
        assert_eq!(definition.trigger_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_load_repository_definition_missing_root_is_error() {
        let dir = tempdir().expect("Failed to create temp dir");
        let result = load_repository_definition(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(ConfigError::CheckoutNotFound(_))));
    }

    #[test]
    fn test_parse_definition_entries() {
        let entries = vec![
            ArchiveEntry {
                path: "flowgate/extra.yml".to_string(),
                content: "flows:\n  extra: []\n".to_string(),
            },
            ArchiveEntry {
                path: DEFINITION_FILE.to_string(),
                content: "flows:\n  main: []\n".to_string(),
            },
            ArchiveEntry {
                path: "src/flowgate/nested.yml".to_string(),
                content: "flows:\n  nested: []\n".to_string(),
            },
        ];

        let definition = parse_definition_entries(&entries).expect("Entries should parse");
        assert!(definition.flows.contains_key("main"));
        assert!(definition.flows.contains_key("extra"));
        assert!(!definition.flows.contains_key("nested"));
    }

    #[test]
    fn test_parse_definition_entries_reports_path() {
        let entries = vec![ArchiveEntry {
            path: DEFINITION_FILE.to_string(),
            content: "flows: [unclosed".to_string(),
        }];

        let err = parse_definition_entries(&entries).expect_err("Invalid YAML should fail");
        assert!(err.to_string().contains(DEFINITION_FILE));
    }
}
