//! Errors raised while loading `flowgate.toml` and repository definitions.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `flowgate.toml` is not valid TOML or does not fit the schema.
    #[error("Invalid server configuration {path}: {source}")]
    ServerToml {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A semantic check of `flowgate.toml` failed (duplicate ids, zero capacity).
    #[error("Invalid server configuration {path}: {reason}")]
    ServerRule { path: PathBuf, reason: String },

    /// A definition file or archive entry is not a valid definition.
    #[error("Invalid repository definition {path}: {source}")]
    DefinitionYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Unable to list definition fragments in {path}: {source}")]
    Fragments {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("Repository checkout {0} not found")]
    CheckoutNotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
