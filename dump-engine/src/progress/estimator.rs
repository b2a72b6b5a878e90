//! Progress estimate for the packing phase.
//!
//! The zip writer only tells us how many entries it has finished, and one
//! huge data file can hold most of the bytes. The estimate therefore takes
//! the larger of the entry-count fraction and the elapsed fraction of an
//! assumed worst-case duration, mapped into the packing band and capped
//! below 100.

use super::phase;
use super::tracker::ProgressTracker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PackingEstimator {
    total_files: usize,
    worst_case: Duration,
    last: u8,
}

impl PackingEstimator {
    pub fn new(total_files: usize, worst_case: Duration) -> Self {
        Self {
            total_files,
            worst_case,
            last: phase::PACK_START,
        }
    }

    /// Percent for `entries_done` written after `elapsed`. Never lower than
    /// the previous call's result.
    pub fn estimate(&mut self, entries_done: usize, elapsed: Duration) -> u8 {
        let by_entries = if self.total_files == 0 {
            0.0
        } else {
            (entries_done as f64 / self.total_files as f64).min(1.0)
        };
        let by_time = if self.worst_case.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / self.worst_case.as_secs_f64()).min(1.0)
        };

        let span = f64::from(phase::PACK_CEILING - phase::PACK_START);
        let percent = phase::PACK_START + (by_entries.max(by_time) * span).floor() as u8;
        self.last = self.last.max(percent.min(phase::PACK_CEILING));
        self.last
    }

    /// Report an estimate every `tick` until `stop` is cancelled.
    ///
    /// `entries` is advanced by the packer as each archive entry completes.
    pub fn spawn(
        mut self,
        tracker: Arc<ProgressTracker>,
        entries: Arc<AtomicUsize>,
        tick: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(tick);
            let mut reported = 0u8;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                let done = entries.load(Ordering::Relaxed);
                let percent = self.estimate(done, started.elapsed());
                if percent == reported {
                    continue;
                }
                reported = percent;

                let step = format!("Packing backup file ({}/{} files)", done.min(self.total_files), self.total_files);
                if let Err(e) = tracker.update(percent, step).await {
                    warn!("Failed to record packing progress: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DumpEvents;
    use tempfile::TempDir;

    #[test]
    fn test_entry_fraction_dominates() {
        let mut est = PackingEstimator::new(10, Duration::from_secs(600));
        assert_eq!(est.estimate(0, Duration::ZERO), 90);
        assert_eq!(est.estimate(5, Duration::from_secs(1)), 94);
        assert_eq!(est.estimate(10, Duration::from_secs(2)), 99);
    }

    #[test]
    fn test_time_fraction_dominates() {
        let mut est = PackingEstimator::new(1, Duration::from_secs(100));
        assert_eq!(est.estimate(0, Duration::from_secs(50)), 94);
        assert_eq!(est.estimate(0, Duration::from_secs(1000)), 99);
    }

    #[test]
    fn test_never_regresses_and_caps() {
        let mut est = PackingEstimator::new(4, Duration::from_secs(10));
        let high = est.estimate(3, Duration::from_secs(1));
        let later = est.estimate(1, Duration::from_secs(2));
        assert!(later >= high);
        assert_eq!(est.estimate(100, Duration::from_secs(100)), 99);
    }

    #[tokio::test]
    async fn test_spawned_estimator_reports_until_stopped() {
        let dir = TempDir::new().unwrap();
        let tracker = Arc::new(ProgressTracker::new("backup_a.tego", dir.path().join("p"), DumpEvents::new()));
        let entries = Arc::new(AtomicUsize::new(2));
        let stop = CancellationToken::new();

        let handle = PackingEstimator::new(4, Duration::from_secs(600)).spawn(
            tracker.clone(),
            entries.clone(),
            Duration::from_millis(10),
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();
        handle.await.unwrap();

        let record = tracker.current().await.unwrap();
        assert!(record.percent >= 94 && record.percent <= 99);
        assert!(record.current_step.contains("2/4"));
    }
}
