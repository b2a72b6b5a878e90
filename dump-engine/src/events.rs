//! In-process event sink for dump lifecycle notifications.
//!
//! The engine owns a [`DumpEvents`] handle and publishes to it; any number of
//! subscribers (a UI bridge, the CLI, tests) receive every event sent after
//! they subscribed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DumpEvent {
    #[serde(rename = "dump:started")]
    Started {
        file_name: String,
        app_name: Option<String>,
        groups: Vec<String>,
    },

    #[serde(rename = "dump:progress")]
    Progress {
        file_name: String,
        percent: u8,
        current_step: String,
    },

    #[serde(rename = "dump:completed")]
    Completed {
        file_name: String,
        file_path: PathBuf,
        file_size: u64,
        duration_secs: u64,
    },

    #[serde(rename = "dump:failed")]
    Failed { file_name: String, error: String },
}

/// Broadcast handle shared by everything that reports on a dump
#[derive(Debug, Clone)]
pub struct DumpEvents {
    tx: broadcast::Sender<DumpEvent>,
}

impl DumpEvents {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: DumpEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Dump event delivered to {} subscriber(s)", count),
            Err(_) => debug!("Dump event dropped (no subscribers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DumpEvent> {
        self.tx.subscribe()
    }
}

impl Default for DumpEvents {
    fn default() -> Self {
        Self::new()
    }
}
