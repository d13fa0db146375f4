use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GuardError>;

/// Failures surfaced by the guard.
///
/// Out-of-scope paths and mismatched task ids are not errors; they come back
/// as `Ok(true)` and `Ok(false)` from the gate operations.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Filesystem error on {path:?}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Background task error: {0}")]
    Join(String),
}

impl GuardError {
    pub fn file_system(path: impl Into<PathBuf>, source: io::Error) -> Self {
        GuardError::FileSystem {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for GuardError {
    fn from(e: tokio::task::JoinError) -> Self {
        GuardError::Join(e.to_string())
    }
}
