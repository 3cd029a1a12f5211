//! Error types for loading entries and launching their processes.

use std::path::PathBuf;

use thiserror::Error;

/// A config file could not be read, parsed, or validated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("no apps defined in {0}")]
    Empty(String),

    #[error("app #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("duplicate app name `{0}`")]
    DuplicateName(String),

    #[error("invalid `{field}` for {name}: {message}")]
    InvalidField {
        name: String,
        field: &'static str,
        message: String,
    },
}

/// The executable of an entry could not be started.
#[derive(Debug, Error)]
#[error("failed to spawn `{program}` for {name}: {source}")]
pub struct SpawnError {
    pub name: String,
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

impl SpawnError {
    pub fn kind(&self) -> std::io::ErrorKind {
        self.source.kind()
    }
}
