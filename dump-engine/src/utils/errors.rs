//! Error types for the dump engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DumpError {
    /// A collection declares dump rules the engine cannot interpret.
    /// Fatal for the whole run.
    #[error("Invalid dump rules on collection {collection}: {reason}")]
    Config { collection: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Backup {0} is already in progress")]
    LockHeld(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid backup file name: {0}")]
    InvalidFileName(String),

    #[error("Task error: {0}")]
    Task(String),
}

impl DumpError {
    pub fn config(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }
}

impl From<tokio::task::JoinError> for DumpError {
    fn from(err: tokio::task::JoinError) -> Self {
        DumpError::Task(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DumpError>;
