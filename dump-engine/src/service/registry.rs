//! In-flight dump tracking, keyed by backup file name.

use crate::dumper::DumpOutput;
use crate::utils::{DumpError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Final result of a dump as seen by observers. Errors are flattened to
/// their message so the outcome can be shared.
pub type DumpOutcome = std::result::Result<DumpOutput, String>;

type OutcomeTx = watch::Sender<Option<DumpOutcome>>;
type OutcomeRx = watch::Receiver<Option<DumpOutcome>>;

/// Tracks running dumps; at most one per file name
#[derive(Clone)]
pub struct DumpTaskRegistry {
    tasks: Arc<RwLock<HashMap<String, OutcomeRx>>>,
}

impl DumpTaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Claim `file_name` for a new dump. Fails if one is already running.
    ///
    /// The returned sender publishes the outcome; call
    /// [`complete`](Self::complete) afterwards.
    pub async fn register(&self, file_name: &str) -> Result<OutcomeTx> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(file_name) {
            return Err(DumpError::LockHeld(file_name.to_string()));
        }
        let (tx, rx) = watch::channel(None);
        tasks.insert(file_name.to_string(), rx);
        Ok(tx)
    }

    /// Remove a dump from tracking (finished, failed, or never started)
    pub async fn complete(&self, file_name: &str) {
        self.tasks.write().await.remove(file_name);
    }

    pub async fn contains(&self, file_name: &str) -> bool {
        self.tasks.read().await.contains_key(file_name)
    }

    pub async fn running_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Outcome channel of a running dump
    pub async fn subscribe(&self, file_name: &str) -> Option<OutcomeRx> {
        self.tasks.read().await.get(file_name).cloned()
    }
}

impl Default for DumpTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until the outcome is published
pub async fn wait_outcome(mut rx: OutcomeRx) -> Result<DumpOutput> {
    let outcome = match rx.wait_for(|o| o.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };

    match outcome {
        Some(Ok(output)) => Ok(output),
        Some(Err(msg)) => Err(DumpError::Task(msg)),
        None => Err(DumpError::Task("dump task ended without reporting an outcome".to_string())),
    }
}
