// src/errors.rs

//! Errors raised before any test case runs. Failures inside a test case's
//! pipeline are outcomes, not errors, and end up in the run report.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HpctestError {
    /// The config parsed but does not describe a runnable suite.
    #[error("invalid config: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("test '{dependent}' depends on unknown test '{dependency}'")]
    UnknownDependency {
        dependent: String,
        dependency: String,
    },

    /// First node repeated at the end of `path`.
    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("malformed config: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HpctestError>;
