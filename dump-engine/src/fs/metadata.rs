//! File stat helpers used when deriving backup status.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// The subset of file metadata the status protocol relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: DateTime<Utc>,

    /// Birth time where the filesystem records it, otherwise the modified time
    pub created: DateTime<Utc>,
}

impl FileStat {
    /// Stat a path. Returns `Ok(None)` when it does not exist.
    pub fn from_path(path: &Path) -> std::io::Result<Option<Self>> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let modified = metadata.modified()?;
        let created = metadata.created().unwrap_or(modified);

        Ok(Some(Self {
            size: metadata.len(),
            modified: to_utc(modified),
            created: to_utc(created),
        }))
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
