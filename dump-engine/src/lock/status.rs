//! Derived status of a named backup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one backup file, computed from the lock, progress, and archive
/// files on every read. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupFileStatus {
    #[serde(rename_all = "camelCase")]
    Ok {
        name: String,
        created_at: DateTime<Utc>,
        file_size: u64,
    },

    #[serde(rename_all = "camelCase")]
    InProgress {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step: Option<String>,
    },

    /// The lock outlived the staleness window: the job that held it died
    #[serde(rename_all = "camelCase")]
    Error {
        name: String,
        created_at: DateTime<Utc>,
    },
}

impl BackupFileStatus {
    pub fn name(&self) -> &str {
        match self {
            BackupFileStatus::Ok { name, .. }
            | BackupFileStatus::InProgress { name, .. }
            | BackupFileStatus::Error { name, .. } => name,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BackupFileStatus::Ok { .. } => "ok",
            BackupFileStatus::InProgress { .. } => "in_progress",
            BackupFileStatus::Error { .. } => "error",
        }
    }
}
