//! Per-job progress tracker.

use super::notifier::{NotifyTarget, ProgressNotifier};
use super::{phase, ProgressRecord};
use crate::events::{DumpEvent, DumpEvents};
use crate::utils::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Persists `{percent, currentStep}` for one job and fans it out.
///
/// Percent never decreases: an update below the last reported value is
/// raised to it. Shared behind an `Arc` so the packing estimator can report
/// from its own task.
pub struct ProgressTracker {
    file_name: String,
    progress_path: PathBuf,
    target: Option<NotifyTarget>,
    notifier: Option<Arc<dyn ProgressNotifier>>,
    events: DumpEvents,
    // Held across the file write so concurrent updates land in order
    last: Mutex<Option<ProgressRecord>>,
}

impl ProgressTracker {
    pub fn new(file_name: impl Into<String>, progress_path: impl Into<PathBuf>, events: DumpEvents) -> Self {
        Self {
            file_name: file_name.into(),
            progress_path: progress_path.into(),
            target: None,
            notifier: None,
            events,
            last: Mutex::new(None),
        }
    }

    /// Also push every update to `notifier`, addressed to `target`
    pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>, target: NotifyTarget) -> Self {
        self.notifier = Some(notifier);
        self.target = Some(target);
        self
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    /// Last reported record
    pub async fn current(&self) -> Option<ProgressRecord> {
        self.last.lock().await.clone()
    }

    /// Overwrite the progress file, then push and broadcast.
    pub async fn update(&self, percent: u8, step: impl Into<String>) -> Result<ProgressRecord> {
        let mut last = self.last.lock().await;
        let floor = last.as_ref().map(|r| r.percent).unwrap_or(0);
        let record = ProgressRecord::new(percent.max(floor), step);

        let body = serde_json::to_vec(&record)?;
        tokio::fs::write(&self.progress_path, body).await?;
        *last = Some(record.clone());
        drop(last);

        debug!("[{}] {}% {}", self.file_name, record.percent, record.current_step);
        self.push(&record).await;
        self.events.emit(DumpEvent::Progress {
            file_name: self.file_name.clone(),
            percent: record.percent,
            current_step: record.current_step.clone(),
        });

        Ok(record)
    }

    /// Report 100% and delete the progress file
    pub async fn finish(&self, step: impl Into<String>) -> Result<()> {
        self.update(phase::DONE, step).await?;
        match tokio::fs::remove_file(&self.progress_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn push(&self, record: &ProgressRecord) {
        let (Some(notifier), Some(target)) = (&self.notifier, &self.target) else {
            return;
        };
        if let Err(e) = notifier.notify(target, &self.file_name, record).await {
            warn!(
                "Failed to push progress for {} to {}/{}: {:#}",
                self.file_name, target.app_name, target.user_id, e
            );
        }
    }
}
