//! Dump service: the caller side of the lock protocol.
//!
//! Acquires `<name>.lock`, runs the engine, and releases the lock and
//! progress file whatever the outcome. Owns the in-flight registry and the
//! concurrency bound.

pub mod registry;

use crate::config::Config;
use crate::dumper::{DumpEngine, DumpOutput, DumpRequest, DumpSettings};
use crate::lock::{BackupFileStatus, BackupStorage};
use crate::progress::HttpNotifier;
use crate::repository::Repository;
use crate::utils::{DumpError, Result};
use registry::{wait_outcome, DumpOutcome, DumpTaskRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

/// A dump started in the background
pub struct DumpTicket {
    pub file_name: String,
    outcome: watch::Receiver<Option<DumpOutcome>>,
}

impl DumpTicket {
    pub async fn wait(self) -> Result<DumpOutput> {
        wait_outcome(self.outcome).await
    }
}

#[derive(Clone)]
pub struct DumpService {
    engine: Arc<DumpEngine>,
    registry: DumpTaskRegistry,
    permits: Arc<Semaphore>,
}

impl DumpService {
    pub fn new(engine: DumpEngine, max_concurrent_dumps: usize) -> Self {
        Self {
            engine: Arc::new(engine),
            registry: DumpTaskRegistry::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_dumps.max(1))),
        }
    }

    /// Wire storage, settings, and the optional push gateway from config
    pub fn from_config(config: &Config, repo: Arc<dyn Repository>) -> anyhow::Result<Self> {
        let storage = BackupStorage::new(
            config.backups_dir(),
            config.dump.file_extension.clone(),
            config.lock_stale_after(),
        );
        let mut engine = DumpEngine::new(repo, storage, DumpSettings::from_config(config));

        if let Some(url) = &config.notify.url {
            let notifier = HttpNotifier::new(url.clone(), Duration::from_secs(config.notify.timeout_secs))?;
            engine = engine.with_notifier(Arc::new(notifier));
            info!("Pushing dump progress to {}", url);
        }

        Ok(Self::new(engine, config.dump.max_concurrent_dumps))
    }

    pub fn engine(&self) -> &DumpEngine {
        &self.engine
    }

    pub fn registry(&self) -> &DumpTaskRegistry {
        &self.registry
    }

    /// Lock the target name and run the dump in a background task.
    ///
    /// Returns once the lock is held; the ticket resolves when the dump ends.
    pub async fn start(&self, request: DumpRequest) -> Result<DumpTicket> {
        let (request, file_name) = self.with_file_name(request)?;
        let tx = self.acquire(&file_name, request.app_name.as_deref()).await?;
        let outcome = tx.subscribe();

        let service = self.clone();
        let name = file_name.clone();
        tokio::spawn(async move {
            let result = service.run_locked(request).await;
            tx.send_replace(Some(result.map_err(|e| e.to_string())));
            service.registry.complete(&name).await;
        });

        Ok(DumpTicket { file_name, outcome })
    }

    /// Lock the target name and run the dump to completion
    pub async fn run(&self, request: DumpRequest) -> Result<DumpOutput> {
        let (request, file_name) = self.with_file_name(request)?;
        let tx = self.acquire(&file_name, request.app_name.as_deref()).await?;

        let result = self.run_locked(request).await;
        tx.send_replace(Some(match &result {
            Ok(output) => Ok(output.clone()),
            Err(e) => Err(e.to_string()),
        }));
        self.registry.complete(&file_name).await;
        result
    }

    /// Wait for a dump started by this service
    pub async fn wait(&self, file_name: &str) -> Result<DumpOutput> {
        let rx = self
            .registry
            .subscribe(file_name)
            .await
            .ok_or_else(|| DumpError::NotFound(format!("no running dump named {}", file_name)))?;
        wait_outcome(rx).await
    }

    pub async fn is_running(&self, file_name: &str) -> bool {
        self.registry.contains(file_name).await
    }

    pub async fn status(&self, file_path: &str, app_name: Option<&str>) -> Result<Option<BackupFileStatus>> {
        self.engine.get_file_status(file_path, app_name).await
    }

    pub async fn list(&self, app_name: Option<&str>, include_in_progress: bool) -> Result<Vec<PathBuf>> {
        self.engine.all_backup_file_paths(app_name, include_in_progress).await
    }

    fn with_file_name(&self, mut request: DumpRequest) -> Result<(DumpRequest, String)> {
        let storage = self.engine.storage();
        let file_name = match request.file_name.take() {
            Some(name) => {
                storage.validate_file_name(&name)?;
                name
            }
            None => storage.generate_file_name(),
        };
        request.file_name = Some(file_name.clone());
        Ok((request, file_name))
    }

    /// Registry entry first, then the lock file. Either refusal is `LockHeld`.
    async fn acquire(&self, file_name: &str, app_name: Option<&str>) -> Result<watch::Sender<Option<DumpOutcome>>> {
        let tx = self.registry.register(file_name).await?;
        if let Err(e) = self.engine.storage().write_lock(file_name, app_name).await {
            self.registry.complete(file_name).await;
            return Err(e);
        }
        Ok(tx)
    }

    async fn run_locked(&self, request: DumpRequest) -> Result<DumpOutput> {
        let app_name = request.app_name.clone();
        let file_name = request.file_name.clone().unwrap_or_default();

        let result = match self.permits.acquire().await {
            Ok(_permit) => self.engine.dump(request).await,
            Err(e) => Err(DumpError::Task(format!("dump queue closed: {}", e))),
        };

        if let Err(e) = self.engine.storage().clean_lock(&file_name, app_name.as_deref()).await {
            warn!("Failed to release lock for {}: {}", file_name, e);
        }
        result
    }
}
