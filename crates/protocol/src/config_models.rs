//! Server configuration models for `flowgate.toml`.
//!
//! Every section is optional; a missing file or section falls back to the
//! defaults documented on each field.
//!
//! # Example
//!
//! ```toml
//! data_dir = "/var/lib/flowgate"
//!
//! [server]
//! bind = "0.0.0.0:8001"
//!
//! [github]
//! secret = "s3cr3t"
//! default_branch = "main"
//! disable_repos_on_deleted_ref = true
//!
//! [[repositories]]
//! org = "Default"
//! project = "app"
//! name = "app"
//! url = "https://github.com/acme/app.git"
//! path = "/srv/checkouts/app"
//!
//! [[workers]]
//! id = "worker-1"
//! capabilities = { os = "linux", flavor = "default" }
//! max_concurrency = 4
//!
//! [[policy.rules]]
//! name = "no-admin-flows"
//! type = "denyEntryPoint"
//! pattern = "admin.*"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Root of `flowgate.toml`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory for the persisted state snapshot. `None` keeps state in memory only.
    pub data_dir: Option<PathBuf>,

    pub server: HttpConfig,
    pub github: GithubConfig,
    pub dispatcher: DispatcherConfig,
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
    pub dependencies: DependencyConfig,
    pub policy: PolicyConfig,
    pub repositories: Vec<RepositoryConfig>,
    pub workers: Vec<WorkerConfig>,
}

/// HTTP listener settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address (default `0.0.0.0:8001`).
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8001".to_string(),
        }
    }
}

/// GitHub webhook settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GithubConfig {
    /// Shared HMAC secret. Webhooks are rejected while unset.
    pub secret: Option<String>,

    /// Branch assumed for repositories without an explicit branch.
    pub default_branch: String,

    /// Disable repositories whose tracked branch is deleted by a push.
    pub disable_repos_on_deleted_ref: bool,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            secret: None,
            default_branch: "master".to_string(),
            disable_repos_on_deleted_ref: false,
        }
    }
}

/// Queue dispatcher settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Poll interval in milliseconds (default 250).
    pub poll_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

/// Archive size policy applied when a process is created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum total archive size in bytes (default 10 MiB).
    pub max_archive_bytes: usize,

    /// Maximum number of archive entries (default 1000).
    pub max_archive_entries: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: 10 * 1024 * 1024,
            max_archive_entries: 1000,
        }
    }
}

/// Bounded retry of transient infrastructure failures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one (default 3).
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds (default 500).
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 500,
        }
    }
}

/// Dependency resolution settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DependencyConfig {
    /// Per-dependency resolution timeout in seconds (default 30).
    pub timeout_secs: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Admission policy.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Rules evaluated in order; the first violated rule denies admission.
    pub rules: Vec<PolicyRule>,
}

/// A named admission rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub name: String,

    #[serde(flatten)]
    pub check: PolicyCheck,
}

/// The check a policy rule performs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PolicyCheck {
    /// Deny entry points fully matching the pattern.
    DenyEntryPoint { pattern: String },

    /// Deny initiators fully matching the pattern.
    DenyInitiator { pattern: String },

    /// Deny processes started without a project.
    RequireProject,
}

/// A repository registered at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RepositoryConfig {
    pub org: String,
    pub project: String,
    pub name: String,
    pub url: String,

    #[serde(default)]
    pub branch: Option<String>,

    /// Local checkout used by repository refresh.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// A worker slot pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub id: String,

    /// Capabilities matched against process requirements.
    #[serde(default)]
    pub capabilities: Map<String, Value>,

    /// Processes the worker executes at the same time (default 1).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// External program speaking the JSON Lines worker protocol. Without it
    /// the worker interprets flows in-process.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

fn default_max_concurrency() -> usize {
    1
}
