//! Registered repositories and their definitions.
//!
//! This module provides:
//! - [`RepositoryRegistry`]: repositories known to the core, used to classify
//!   events as known or unknown and to resolve default branches
//! - [`RepositoryRefresher`]: re-reads a repository checkout and atomically
//!   replaces the triggers it owns

pub mod refresh;
pub mod registry;

pub use refresh::{LocalPathFetcher, RepositoryFetcher, RepositoryRefresher};
pub use registry::RepositoryRegistry;

use fg_protocol::repository_models::Repository;
use std::fmt;

/// Identity of a repository: organization, project and repository name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryKey {
    pub org: String,
    pub project: String,
    pub name: String,
}

impl RepositoryKey {
    pub fn new(org: impl Into<String>, project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
            name: name.into(),
        }
    }
}

impl From<&Repository> for RepositoryKey {
    fn from(r: &Repository) -> Self {
        Self::new(r.org.clone(), r.project.clone(), r.name.clone())
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org, self.project, self.name)
    }
}
