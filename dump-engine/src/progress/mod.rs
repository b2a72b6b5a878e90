//! Durable, monotonic progress reporting for a dump job.
//!
//! A job's progress is a single `{percent, currentStep}` record persisted to
//! the `<name>.progress` side file next to the archive. The tracker also
//! pushes each record to an optional notification gateway and to the
//! in-process event sink.

pub mod estimator;
pub mod notifier;
pub mod tracker;

use serde::{Deserialize, Serialize};

pub use estimator::PackingEstimator;
pub use notifier::{HttpNotifier, NotifyTarget, ProgressNotifier};
pub use tracker::ProgressTracker;

/// Phase bands, in percent. Each phase reports inside its band so the
/// overall value never moves backwards.
pub mod phase {
    pub const PREPARE_START: u8 = 0;
    pub const PREPARE_END: u8 = 5;
    pub const COLLECTIONS_START: u8 = 5;
    pub const COLLECTIONS_END: u8 = 70;
    pub const META_START: u8 = 70;
    pub const META_END: u8 = 80;
    pub const DB_CONTENT_START: u8 = 80;
    pub const DB_CONTENT_END: u8 = 88;
    pub const PACK_START: u8 = 90;
    pub const PACK_CEILING: u8 = 99;
    pub const DONE: u8 = 100;

    /// Linear position of item `index` of `total` inside `[start, end]`
    pub fn interpolate(start: u8, end: u8, index: usize, total: usize) -> u8 {
        if total == 0 {
            return end;
        }
        let span = f64::from(end - start);
        let fraction = (index.min(total) as f64) / (total as f64);
        start + (span * fraction).floor() as u8
    }
}

/// The persisted progress record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub percent: u8,
    pub current_step: String,
}

impl ProgressRecord {
    pub fn new(percent: u8, current_step: impl Into<String>) -> Self {
        Self {
            percent: percent.min(phase::DONE),
            current_step: current_step.into(),
        }
    }
}
