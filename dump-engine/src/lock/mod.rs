//! Lock-file protocol for backup files.
//!
//! For every backup file name `<name>` in a backup directory:
//! - `<name>.lock` marks a dump in flight; only its existence and age matter
//! - `<name>.progress` holds the latest [`ProgressRecord`]
//! - `<name>` itself is the finished archive
//!
//! Status is derived from these files on every read. A live lock always wins
//! over an existing archive, and a lock older than the staleness window is
//! reported as an error (the job that created it died).

pub mod status;

use crate::fs::metadata::FileStat;
use crate::progress::ProgressRecord;
use crate::utils::{DumpError, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use status::BackupFileStatus;

const LOCK_SUFFIX: &str = ".lock";
const PROGRESS_SUFFIX: &str = ".progress";

/// The app whose backups live directly under the backups root
pub const MAIN_APP: &str = "main";

/// Backup storage layout plus the lock/status protocol on top of it
#[derive(Debug, Clone)]
pub struct BackupStorage {
    backups_root: PathBuf,
    extension: String,
    stale_after: Duration,
}

impl BackupStorage {
    pub fn new(backups_root: impl Into<PathBuf>, extension: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            backups_root: backups_root.into(),
            extension: extension.into(),
            stale_after,
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// `<root>` for the main app, `<root>/<app>` for sub-apps
    pub fn backup_dir(&self, app_name: Option<&str>) -> PathBuf {
        match app_name {
            Some(app) if app != MAIN_APP => self.backups_root.join(app),
            _ => self.backups_root.clone(),
        }
    }

    pub fn archive_path(&self, file_name: &str, app_name: Option<&str>) -> PathBuf {
        self.backup_dir(app_name).join(file_name)
    }

    pub fn lock_path(&self, file_name: &str, app_name: Option<&str>) -> PathBuf {
        self.backup_dir(app_name)
            .join(format!("{}{}", file_name, LOCK_SUFFIX))
    }

    pub fn progress_path(&self, file_name: &str, app_name: Option<&str>) -> PathBuf {
        self.backup_dir(app_name)
            .join(format!("{}{}", file_name, PROGRESS_SUFFIX))
    }

    /// `backup_<YYYYMMDD>_<HHMMSS>_<4 hex>.<ext>`
    pub fn generate_file_name(&self) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("backup_{}_{}.{}", stamp, &suffix[..4], self.extension)
    }

    /// Reject names that would escape the backup directory or that the
    /// listing would never find.
    pub fn validate_file_name(&self, file_name: &str) -> Result<()> {
        let bad_chars = file_name.contains('/') || file_name.contains('\\') || file_name.contains('\0');
        let expected_suffix = format!(".{}", self.extension);

        if file_name.is_empty() || bad_chars || file_name.starts_with('.') {
            return Err(DumpError::InvalidFileName(file_name.to_string()));
        }
        if !file_name.ends_with(&expected_suffix) || file_name.len() == expected_suffix.len() {
            return Err(DumpError::InvalidFileName(format!(
                "{} (expected a *{} name)",
                file_name, expected_suffix
            )));
        }
        Ok(())
    }

    /// Create `<name>.lock` atomically.
    ///
    /// A live lock yields [`DumpError::LockHeld`]. A stale one (its owner
    /// died) is replaced.
    pub async fn write_lock(&self, file_name: &str, app_name: Option<&str>) -> Result<PathBuf> {
        self.validate_file_name(file_name)?;
        let lock_path = self.lock_path(file_name, app_name);
        tokio::fs::create_dir_all(self.backup_dir(app_name)).await?;

        let body = json!({
            "pid": std::process::id(),
            "createdAt": Utc::now().to_rfc3339(),
        })
        .to_string();

        let path = lock_path.clone();
        let stale_after = self.stale_after;
        let name = file_name.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            match create_exclusive(&path, body.as_bytes()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let stale = FileStat::from_path(&path)?
                        .map(|stat| age_of(stat.modified, Utc::now()) >= stale_after)
                        .unwrap_or(true);
                    if !stale {
                        return Err(DumpError::LockHeld(name));
                    }
                    warn!("Replacing stale lock {}", path.display());
                    take_stale_lock(&path, stale_after, &name)?;
                    create_exclusive(&path, body.as_bytes()).map_err(|e| {
                        if e.kind() == io::ErrorKind::AlreadyExists {
                            DumpError::LockHeld(name)
                        } else {
                            DumpError::Io(e)
                        }
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await??;

        info!("Acquired lock {}", lock_path.display());
        Ok(lock_path)
    }

    /// Delete the lock and progress side files. Missing files are fine.
    pub async fn clean_lock(&self, file_name: &str, app_name: Option<&str>) -> Result<()> {
        let lock_path = self.lock_path(file_name, app_name);
        let progress_path = self.progress_path(file_name, app_name);

        remove_if_exists_async(&lock_path).await?;
        remove_if_exists_async(&progress_path).await?;
        debug!("Released lock {}", lock_path.display());
        Ok(())
    }

    /// Path of the lock file if one exists
    pub async fn get_lock_file(&self, file_name: &str, app_name: Option<&str>) -> Option<PathBuf> {
        let path = self.lock_path(file_name, app_name);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    /// Derive the status of a backup file. `None` when neither a lock nor an
    /// archive exists.
    pub async fn status_of(&self, file_path: &str, app_name: Option<&str>) -> Result<Option<BackupFileStatus>> {
        self.status_at(file_path, app_name, Utc::now()).await
    }

    /// [`status_of`](Self::status_of) evaluated at a fixed instant
    pub async fn status_at(
        &self,
        file_path: &str,
        app_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<BackupFileStatus>> {
        let name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DumpError::InvalidFileName(file_path.to_string()))?;

        let lock_path = self.lock_path(&name, app_name);
        let archive_path = self.archive_path(&name, app_name);
        let progress_path = self.progress_path(&name, app_name);
        let stale_after = self.stale_after;

        tokio::task::spawn_blocking(move || -> Result<Option<BackupFileStatus>> {
            if let Some(lock) = FileStat::from_path(&lock_path)? {
                if age_of(lock.modified, now) < stale_after {
                    let progress = read_progress(&progress_path);
                    return Ok(Some(BackupFileStatus::InProgress {
                        name,
                        progress: progress.as_ref().map(|p| p.percent),
                        current_step: progress.map(|p| p.current_step),
                    }));
                }
                return Ok(Some(BackupFileStatus::Error {
                    name,
                    created_at: lock.modified,
                }));
            }

            Ok(FileStat::from_path(&archive_path)?.map(|archive| BackupFileStatus::Ok {
                name,
                created_at: archive.created,
                file_size: archive.size,
            }))
        })
        .await?
    }

    /// Backup file paths in an app's backup directory, newest first.
    ///
    /// With `include_in_progress`, names that only have a lock file are
    /// listed too (as the archive path they will eventually occupy).
    pub async fn list_backups(&self, app_name: Option<&str>, include_in_progress: bool) -> Result<Vec<PathBuf>> {
        let dir = self.backup_dir(app_name);
        let archive_suffix = format!(".{}", self.extension);
        let lock_suffix = format!("{}{}", archive_suffix, LOCK_SUFFIX);

        tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut archives: HashMap<String, DateTime<Utc>> = HashMap::new();
            let mut locked: HashMap<String, DateTime<Utc>> = HashMap::new();
            for entry in read_dir {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().to_string();

                let (name, into) = if file_name.ends_with(&archive_suffix) {
                    (file_name, &mut archives)
                } else if file_name.ends_with(&lock_suffix) {
                    (file_name[..file_name.len() - LOCK_SUFFIX.len()].to_string(), &mut locked)
                } else {
                    continue;
                };

                let Some(stat) = FileStat::from_path(&entry.path())? else {
                    continue;
                };
                into.insert(name, stat.created);
            }

            // A locked name is never a finished archive, whatever sits beside the lock
            let mut found = archives;
            for (name, created) in locked {
                if include_in_progress {
                    found
                        .entry(name)
                        .and_modify(|t| *t = (*t).max(created))
                        .or_insert(created);
                } else {
                    found.remove(&name);
                }
            }

            let mut names: Vec<(String, DateTime<Utc>)> = found.into_iter().collect();
            names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
            Ok(names.into_iter().map(|(name, _)| dir.join(name)).collect())
        })
        .await?
    }
}

fn age_of(time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - time).to_std().unwrap_or(Duration::ZERO)
}

/// Move a lock judged stale out of the way so only one acquirer can replace it.
///
/// The rename is atomic: of several acquirers only one finds the file. If the
/// file it moved turns out to be fresh, another acquirer already replaced the
/// stale lock in between; that lock is put back and the caller loses.
fn take_stale_lock(path: &Path, stale_after: Duration, name: &str) -> Result<()> {
    let tombstone = path.with_extension(format!("lock.{}", uuid::Uuid::new_v4().simple()));
    match std::fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(DumpError::LockHeld(name.to_string())),
        Err(e) => return Err(e.into()),
    }

    let still_stale = FileStat::from_path(&tombstone)?
        .map(|stat| age_of(stat.modified, Utc::now()) >= stale_after)
        .unwrap_or(true);
    if still_stale {
        remove_if_exists(&tombstone)?;
        return Ok(());
    }

    // `hard_link` never overwrites, so a lock created meanwhile is left alone
    if let Err(e) = std::fs::hard_link(&tombstone, path) {
        warn!("Could not restore live lock {}: {}", path.display(), e);
    }
    remove_if_exists(&tombstone)?;
    Err(DumpError::LockHeld(name.to_string()))
}

fn create_exclusive(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(body)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_if_exists_async(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// A missing or half-written progress file simply means "no progress yet"
fn read_progress(path: &Path) -> Option<ProgressRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}
