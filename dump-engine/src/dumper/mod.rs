//! Dump engine - exports an application's collections into one archive.
//!
//! A dump runs in phases, each reporting inside its progress band:
//! 1. Prepare: resolve dump rules and select collections by group
//! 2. Collections: stream each selected collection into `collections/<name>/`
//! 3. Meta: write the top-level manifest
//! 4. DB content: run type-declared dump hooks, persist `sql-content.json`
//! 5. Pack: zip the work directory into the backup storage directory
//!
//! The manifest comes before the hooks: nothing in it depends on their
//! output, and `dialectOnly` is decided by the selection alone.
//!
//! The caller owns the lock file around [`DumpEngine::dump`]. The engine owns
//! the work directory and removes it (and any partial archive) on failure.

pub mod collections;
pub mod manifest;
pub mod pack;
pub mod writer;

use crate::config::Config;
use crate::events::{DumpEvent, DumpEvents};
use crate::fs::walker::count_files;
use crate::fs::workdir::WorkDir;
use crate::lock::{BackupFileStatus, BackupStorage, MAIN_APP};
use crate::progress::{phase, NotifyTarget, PackingEstimator, ProgressNotifier, ProgressTracker};
use crate::repository::{CollectionInfo, DumpHookContext, RawValueSerializer, Repository, SqlFragment, ValueSerializer};
use crate::utils::format::{format_bytes, format_duration};
use crate::utils::{DumpError, Result};
use chrono::Utc;
use collections::{
    group_by_group, has_children, normalize_groups, resolve_all, select, validate_collection_name, DumpableCollection,
};
use manifest::{write_json, AutoIncrementMeta, CollectionDumpMeta, Manifest, DATA_FILE, META_FILE, SQL_CONTENT_FILE};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use writer::{write_rows, RowLayout, RowWriter};

/// Engine knobs taken from the `[storage]` and `[dump]` config sections
#[derive(Debug, Clone)]
pub struct DumpSettings {
    /// Parent of per-job work directories
    pub tmp_dir: PathBuf,
    /// Recorded as the manifest version
    pub app_version: String,
    pub pack_tick: Duration,
    pub pack_worst_case: Duration,
}

impl DumpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tmp_dir: config.storage.tmp_dir.clone(),
            app_version: config.dump.app_version.clone(),
            pack_tick: Duration::from_millis(config.dump.pack_tick_ms.max(1)),
            pack_worst_case: Duration::from_secs(config.dump.pack_worst_case_secs),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DumpRequest {
    /// Requested groups; `required` is always added
    pub groups: Vec<String>,
    /// Target archive name, generated when absent
    pub file_name: Option<String>,
    pub app_name: Option<String>,
    /// Receiver of pushed progress, if any
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DumpOutput {
    pub file_name: String,
    pub file_path: PathBuf,
    /// Directory holding the archive
    pub dirname: PathBuf,
    pub file_size: u64,
}

/// Collections resolved once at the start of a dump
#[derive(Debug, Clone)]
pub struct DumpPlan {
    infos: Vec<CollectionInfo>,
    dumpable: Vec<DumpableCollection>,
    groups: BTreeSet<String>,
}

impl DumpPlan {
    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    /// Selected collections, in repository order
    pub fn selected(&self) -> Vec<&DumpableCollection> {
        select(&self.dumpable, &self.groups)
    }

    fn info(&self, name: &str) -> Result<&CollectionInfo> {
        self.infos
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DumpError::NotFound(format!("collection {}", name)))
    }
}

pub struct DumpEngine {
    repo: Arc<dyn Repository>,
    serializer: Arc<dyn ValueSerializer>,
    storage: BackupStorage,
    settings: DumpSettings,
    notifier: Option<Arc<dyn ProgressNotifier>>,
    events: DumpEvents,
}

impl DumpEngine {
    pub fn new(repo: Arc<dyn Repository>, storage: BackupStorage, settings: DumpSettings) -> Self {
        Self {
            repo,
            serializer: Arc::new(RawValueSerializer),
            storage,
            settings,
            notifier: None,
            events: DumpEvents::new(),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn ValueSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ProgressNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_events(mut self, events: DumpEvents) -> Self {
        self.events = events;
        self
    }

    pub fn storage(&self) -> &BackupStorage {
        &self.storage
    }

    pub fn events(&self) -> &DumpEvents {
        &self.events
    }

    /// Every collection with its resolved group. Bad dump rules are fatal.
    pub async fn dumpable_collections(&self) -> Result<Vec<DumpableCollection>> {
        let infos = self.repo.collections().await?;
        resolve_all(&infos)
    }

    pub async fn dumpable_collections_grouped(&self) -> Result<BTreeMap<String, Vec<DumpableCollection>>> {
        Ok(group_by_group(&self.dumpable_collections().await?))
    }

    /// Resolve collections and normalize the requested groups
    pub async fn plan<I, S>(&self, groups: I) -> Result<DumpPlan>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let infos = self.repo.collections().await?;
        let dumpable = resolve_all(&infos)?;
        Ok(DumpPlan {
            infos,
            dumpable,
            groups: normalize_groups(groups),
        })
    }

    /// Run the whole pipeline and return where the archive landed.
    ///
    /// Emits `dump:started` first and exactly one of `dump:completed` or
    /// `dump:failed` last.
    pub async fn dump(&self, request: DumpRequest) -> Result<DumpOutput> {
        let file_name = match &request.file_name {
            Some(name) => {
                self.storage.validate_file_name(name)?;
                name.clone()
            }
            None => self.storage.generate_file_name(),
        };

        let started = Instant::now();
        self.events.emit(DumpEvent::Started {
            file_name: file_name.clone(),
            app_name: request.app_name.clone(),
            groups: normalize_groups(&request.groups).into_iter().collect(),
        });

        match self.run(&file_name, &request).await {
            Ok(output) => {
                let elapsed = started.elapsed().as_secs();
                info!(
                    "Dump {} completed: {} in {}",
                    file_name,
                    format_bytes(output.file_size),
                    format_duration(elapsed)
                );
                self.events.emit(DumpEvent::Completed {
                    file_name,
                    file_path: output.file_path.clone(),
                    file_size: output.file_size,
                    duration_secs: elapsed,
                });
                Ok(output)
            }
            Err(e) => {
                error!("Dump {} failed: {}", file_name, e);
                self.events.emit(DumpEvent::Failed {
                    file_name,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(&self, file_name: &str, request: &DumpRequest) -> Result<DumpOutput> {
        let app = request.app_name.as_deref();
        let dirname = self.storage.backup_dir(app);
        let archive_path = self.storage.archive_path(file_name, app);

        tokio::fs::create_dir_all(&dirname).await?;
        if tokio::fs::try_exists(&archive_path).await? {
            return Err(DumpError::InvalidFileName(format!("{} already exists", file_name)));
        }

        let tracker = Arc::new(self.tracker_for(file_name, request));
        tracker.update(phase::PREPARE_START, "Preparing dump").await?;

        let plan = self.plan(&request.groups).await?;
        info!(
            "Dumping {} collections in groups {:?} into {}",
            plan.selected().len(),
            plan.groups(),
            file_name
        );

        let work_dir = WorkDir::create(&self.settings.tmp_dir).await?;
        if let Err(e) = self.export_and_pack(&work_dir, &plan, file_name, app, &tracker).await {
            if let Err(ce) = work_dir.clear().await {
                warn!("Failed to remove work dir {}: {}", work_dir.path().display(), ce);
            }
            match tokio::fs::remove_file(&archive_path).await {
                Err(re) if re.kind() != std::io::ErrorKind::NotFound => {
                    warn!("Failed to remove partial archive {}: {}", archive_path.display(), re)
                }
                _ => {}
            }
            return Err(e);
        }

        let file_size = tokio::fs::metadata(&archive_path).await?.len();
        Ok(DumpOutput {
            file_name: file_name.to_string(),
            file_path: archive_path,
            dirname,
            file_size,
        })
    }

    async fn export_and_pack(
        &self,
        work_dir: &WorkDir,
        plan: &DumpPlan,
        file_name: &str,
        app: Option<&str>,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<()> {
        let tabular: Vec<&DumpableCollection> = plan.selected().into_iter().filter(|c| !c.custom_dump).collect();
        let total = tabular.len();
        tracker
            .update(phase::PREPARE_END, format!("Prepared {} collections", total))
            .await?;

        for (index, collection) in tabular.iter().enumerate() {
            let percent = phase::interpolate(phase::COLLECTIONS_START, phase::COLLECTIONS_END, index, total);
            tracker
                .update(
                    percent,
                    format!("Dumping collection: {} ({}/{})", collection.name, index + 1, total),
                )
                .await?;

            let info = plan.info(&collection.name)?;
            let parent_only = has_children(&plan.infos, &collection.name);
            self.export_collection(work_dir, info, parent_only).await?;
        }

        tracker.update(phase::META_START, "Writing metadata").await?;
        self.dump_meta(work_dir, plan, Map::new()).await?;

        tracker.update(phase::DB_CONTENT_START, "Dumping database content").await?;
        self.dump_db(work_dir, plan, tracker).await?;

        self.pack_dumped_dir(work_dir, file_name, app, tracker).await?;
        tracker.finish("Completed").await
    }

    fn tracker_for(&self, file_name: &str, request: &DumpRequest) -> ProgressTracker {
        let app = request.app_name.as_deref();
        let tracker = ProgressTracker::new(file_name, self.storage.progress_path(file_name, app), self.events.clone());

        match (&self.notifier, &request.user_id) {
            (Some(notifier), Some(user_id)) => tracker.with_notifier(
                notifier.clone(),
                NotifyTarget {
                    app_name: app.unwrap_or(MAIN_APP).to_string(),
                    user_id: user_id.clone(),
                },
            ),
            _ => tracker,
        }
    }

    /// Stream one collection by name into `work_dir`
    pub async fn dump_collection(&self, work_dir: &WorkDir, name: &str) -> Result<CollectionDumpMeta> {
        let infos = self.repo.collections().await?;
        let info = infos
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DumpError::NotFound(format!("collection {}", name)))?;
        self.export_collection(work_dir, info, has_children(&infos, name)).await
    }

    async fn export_collection(
        &self,
        work_dir: &WorkDir,
        info: &CollectionInfo,
        parent_only: bool,
    ) -> Result<CollectionDumpMeta> {
        validate_collection_name(&info.name)?;
        let dir = work_dir.collection_dir(&info.name);
        tokio::fs::create_dir_all(&dir).await?;

        let layout = RowLayout::for_collection(info);
        let file = File::create(dir.join(DATA_FILE)).await?;
        let mut writer = RowWriter::new(BufWriter::new(file));
        write_rows(self.repo.rows(info, parent_only), &layout, self.serializer.as_ref(), &mut writer).await?;
        let row_count = writer.finish().await?;

        let auto_increment = match info.auto_increment_key() {
            Some(key) => {
                let sequence = self.repo.sequence_state(info, &key.name).await?;
                Some(AutoIncrementMeta {
                    field_name: key.name.clone(),
                    sequence: sequence.unwrap_or_default(),
                })
            }
            None => None,
        };

        let meta = CollectionDumpMeta {
            name: info.name.clone(),
            table_name: info.table_name().to_string(),
            row_count,
            columns: layout.columns().map(String::from).collect(),
            attributes: info
                .attributes
                .iter()
                .map(|a| (a.name.clone(), a.descriptor.clone()))
                .collect(),
            inherits: info.inherits.clone(),
            auto_increment,
        };
        write_json(&dir.join(META_FILE), &meta).await?;
        Ok(meta)
    }

    /// Run dump hooks for selected custom-dump collections and persist the
    /// raw SQL they record, filtered to the dumped groups.
    pub async fn dump_db(
        &self,
        work_dir: &WorkDir,
        plan: &DumpPlan,
        tracker: &ProgressTracker,
    ) -> Result<BTreeMap<String, SqlFragment>> {
        let hooked: Vec<&DumpableCollection> = plan.selected().into_iter().filter(|c| c.custom_dump).collect();
        let total = hooked.len();
        let mut ctx = DumpHookContext::new(work_dir.path());

        for (index, collection) in hooked.iter().enumerate() {
            let percent = phase::interpolate(phase::DB_CONTENT_START, phase::DB_CONTENT_END, index, total);
            tracker
                .update(percent, format!("Dumping database content: {}", collection.name))
                .await?;

            ctx.set_group(&collection.group);
            self.repo.custom_dump(plan.info(&collection.name)?, &mut ctx).await?;
        }

        let mut sql_content = ctx.into_sql_content();
        sql_content.retain(|_, fragment| plan.groups.contains(&fragment.group));
        if !sql_content.is_empty() {
            write_json(&work_dir.path().join(SQL_CONTENT_FILE), &sql_content).await?;
        }

        tracker.update(phase::DB_CONTENT_END, "Database content dumped").await?;
        Ok(sql_content)
    }

    /// Write the top-level manifest, merging `extra` into it
    pub async fn dump_meta(&self, work_dir: &WorkDir, plan: &DumpPlan, extra: Map<String, Value>) -> Result<Manifest> {
        let selected: Vec<DumpableCollection> = plan.selected().into_iter().cloned().collect();
        let dialect_only = selected.iter().any(|c| c.custom_dump).then_some(true);

        let manifest = Manifest {
            version: self.settings.app_version.clone(),
            dialect: self.repo.dialect().to_string(),
            db_config_flags: self.repo.config_flags(),
            grouped_collections: group_by_group(&selected),
            dumped_groups: plan.groups.iter().cloned().collect(),
            delay_restore_collections: selected
                .iter()
                .filter(|c| c.delay_restore)
                .map(|c| c.name.clone())
                .collect(),
            dialect_only,
            created_at: Utc::now(),
            extra,
        };

        write_json(&work_dir.path().join(META_FILE), &manifest).await?;
        Ok(manifest)
    }

    /// Zip the work directory into the backup storage directory, then
    /// remove the work directory.
    pub async fn pack_dumped_dir(
        &self,
        work_dir: &WorkDir,
        file_name: &str,
        app_name: Option<&str>,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PathBuf> {
        let archive_path = self.storage.archive_path(file_name, app_name);
        let root = work_dir.path().to_path_buf();

        let walk_root = root.clone();
        let total_files = tokio::task::spawn_blocking(move || count_files(&walk_root)).await??;
        info!("Packing {} files into {}", total_files, archive_path.display());
        tracker
            .update(phase::PACK_START, format!("Packing backup file (0/{} files)", total_files))
            .await?;

        let entries = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();
        let estimator = PackingEstimator::new(total_files, self.settings.pack_worst_case).spawn(
            tracker.clone(),
            entries.clone(),
            self.settings.pack_tick,
            stop.clone(),
        );

        let dest = archive_path.clone();
        let packed = tokio::task::spawn_blocking(move || pack::pack_dir(&root, &dest, &entries)).await;

        stop.cancel();
        if let Err(e) = estimator.await {
            warn!("Packing estimator ended abnormally: {}", e);
        }

        let size = packed??;
        info!("Packed {} ({})", archive_path.display(), format_bytes(size));

        work_dir.clear().await?;
        Ok(archive_path)
    }

    pub async fn get_file_status(&self, file_path: &str, app_name: Option<&str>) -> Result<Option<BackupFileStatus>> {
        self.storage.status_of(file_path, app_name).await
    }

    /// Archive paths newest-first; with `include_in_progress`, also names
    /// that only have a lock file so far
    pub async fn all_backup_file_paths(&self, app_name: Option<&str>, include_in_progress: bool) -> Result<Vec<PathBuf>> {
        self.storage.list_backups(app_name, include_in_progress).await
    }

    pub async fn get_lock_file(&self, file_name: &str, app_name: Option<&str>) -> Option<PathBuf> {
        self.storage.get_lock_file(file_name, app_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemorySnapshot;
    use crate::repository::MemoryRepository;
    use serde_json::json;
    use std::io::Read;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;
    use zip::ZipArchive;

    fn fixture() -> MemoryRepository {
        let snapshot: MemorySnapshot = serde_json::from_value(json!({
            "dialect": "postgres",
            "configFlags": {"underscored": true, "schema": "public"},
            "collections": [
                {
                    "name": "users",
                    "dumpRules": "required",
                    "attributes": [
                        {"name": "id", "type": "bigInt", "primaryKey": true, "autoIncrement": true},
                        {"name": "nickname", "type": "string"}
                    ],
                    "rows": [{"id": 1, "nickname": "ada"}, {"id": 2, "nickname": "linus"}],
                    "sequence": {"seqName": "users_id_seq", "lastValue": 2}
                },
                {
                    "name": "posts",
                    "tableName": "t_posts",
                    "dumpRules": {"group": "user"},
                    "attributes": [{"name": "id", "type": "bigInt"}, {"name": "title", "type": "string"}],
                    "rows": [{"id": 1, "title": "hello"}, {"id": 2, "title": "again"}, {"id": 3}]
                },
                {
                    "name": "audit_logs",
                    "dumpRules": {"group": "third-party", "delayRestore": true},
                    "attributes": [{"name": "id", "type": "bigInt"}],
                    "rows": [{"id": 1}]
                },
                {
                    "name": "cache",
                    "dumpRules": "skipped",
                    "attributes": [{"name": "key", "type": "string"}],
                    "rows": [{"key": "k"}]
                },
                {
                    "name": "user_stats",
                    "dumpRules": {"group": "user"},
                    "isView": true,
                    "customDump": true,
                    "viewSql": ["CREATE VIEW user_stats AS SELECT count(*) FROM posts"]
                }
            ]
        }))
        .unwrap();
        MemoryRepository::from_snapshot(snapshot)
    }

    fn engine(root: &Path, repo: MemoryRepository) -> DumpEngine {
        let storage = BackupStorage::new(root.join("backups"), "tego", Duration::from_secs(7200));
        let settings = DumpSettings {
            tmp_dir: root.join("tmp"),
            app_version: "1.0.0".to_string(),
            pack_tick: Duration::from_millis(10),
            pack_worst_case: Duration::from_secs(600),
        };
        DumpEngine::new(Arc::new(repo), storage, settings)
    }

    fn request(groups: &[&str], file_name: &str) -> DumpRequest {
        DumpRequest {
            groups: groups.iter().map(|g| g.to_string()).collect(),
            file_name: Some(file_name.to_string()),
            ..Default::default()
        }
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        names
    }

    fn read_entry(path: &Path, name: &str) -> String {
        let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut out = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    fn read_json(path: &Path, name: &str) -> Value {
        serde_json::from_str(&read_entry(path, name)).unwrap()
    }

    fn is_empty_or_missing(dir: &Path) -> bool {
        match std::fs::read_dir(dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn test_dump_only_selected_groups() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());

        let output = engine.dump(request(&["user"], "backup_a.tego")).await.unwrap();
        assert_eq!(output.dirname, tmp.path().join("backups"));
        assert_eq!(output.file_path, tmp.path().join("backups/backup_a.tego"));

        let names = entry_names(&output.file_path);
        assert_eq!(
            names,
            vec![
                "collections/posts/data",
                "collections/posts/meta",
                "collections/users/data",
                "collections/users/meta",
                "meta",
                "sql-content.json",
            ]
        );

        let manifest = read_json(&output.file_path, "meta");
        assert_eq!(manifest["dumpedGroups"], json!(["required", "user"]));
        assert_eq!(manifest["dialect"], "postgres");
        assert_eq!(manifest["version"], "1.0.0");
        assert_eq!(manifest["dbConfigFlags"]["schema"], "public");
        assert_eq!(manifest["dialectOnly"], true);
        let grouped: Vec<&String> = manifest["groupedCollections"].as_object().unwrap().keys().collect();
        assert_eq!(grouped, vec!["required", "user"]);

        let sql = read_json(&output.file_path, "sql-content.json");
        assert_eq!(sql["user_stats"]["group"], "user");

        // Work dir and progress file are gone once the archive is complete
        assert!(is_empty_or_missing(&tmp.path().join("tmp")));
        assert!(!engine.storage().progress_path("backup_a.tego", None).exists());
    }

    #[tokio::test]
    async fn test_required_is_always_dumped() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());

        let output = engine.dump(request(&[], "backup_b.tego")).await.unwrap();
        let names = entry_names(&output.file_path);
        assert!(names.contains(&"collections/users/data".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("collections/posts")));
        assert!(!names.contains(&"sql-content.json".to_string()));

        let manifest = read_json(&output.file_path, "meta");
        assert_eq!(manifest["dumpedGroups"], json!(["required"]));
        assert!(manifest.get("dialectOnly").is_none());
    }

    #[tokio::test]
    async fn test_skipped_never_dumped_and_delay_restore_recorded() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());

        let output = engine
            .dump(request(&["third-party", "skipped"], "backup_c.tego"))
            .await
            .unwrap();
        let names = entry_names(&output.file_path);
        assert!(names.contains(&"collections/audit_logs/data".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("collections/cache")));

        let manifest = read_json(&output.file_path, "meta");
        assert_eq!(manifest["dumpedGroups"], json!(["required", "third-party"]));
        assert_eq!(manifest["delayRestoreCollections"], json!(["audit_logs"]));
    }

    #[tokio::test]
    async fn test_row_count_matches_data_lines() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());
        let output = engine.dump(request(&["user"], "backup_d.tego")).await.unwrap();

        let data = read_entry(&output.file_path, "collections/posts/data");
        let meta = read_json(&output.file_path, "collections/posts/meta");
        assert_eq!(meta["rowCount"], data.lines().count() as u64);
        assert_eq!(meta["tableName"], "t_posts");
        assert_eq!(meta["columns"], json!(["id", "title"]));
        assert_eq!(data.lines().last().unwrap(), "[3,null]");
    }

    #[tokio::test]
    async fn test_auto_increment_snapshot_in_meta() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());
        let output = engine.dump(request(&[], "backup_e.tego")).await.unwrap();

        let meta = read_json(&output.file_path, "collections/users/meta");
        assert_eq!(meta["autoIncrement"]["fieldName"], "id");
        assert_eq!(meta["autoIncrement"]["seqName"], "users_id_seq");
        assert_eq!(meta["autoIncrement"]["lastValue"], 2);
        assert_eq!(meta["attributes"]["id"]["primaryKey"], true);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_events_bracket_the_dump() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());
        let mut rx = engine.events().subscribe();

        engine.dump(request(&["user", "third-party"], "backup_f.tego")).await.unwrap();

        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(n)) => panic!("lagged by {n}"),
            }
        }

        assert!(matches!(events.first(), Some(DumpEvent::Started { .. })));
        assert!(matches!(events.last(), Some(DumpEvent::Completed { .. })));

        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                DumpEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.contains(&phase::META_START));
        assert!(percents.contains(&phase::PACK_START));
    }

    #[tokio::test]
    async fn test_malformed_rules_fail_the_dump() {
        let tmp = TempDir::new().unwrap();
        let repo = fixture().with_collection(
            serde_json::from_value(json!({"name": "broken", "dumpRules": 42})).unwrap(),
            Vec::new(),
        );
        let engine = engine(tmp.path(), repo);
        let mut rx = engine.events().subscribe();

        let err = engine.dump(request(&["user"], "backup_g.tego")).await.unwrap_err();
        match err {
            DumpError::Config { collection, .. } => assert_eq!(collection, "broken"),
            other => panic!("expected a config error, got {other:?}"),
        }

        assert!(!tmp.path().join("backups/backup_g.tego").exists());
        assert!(is_empty_or_missing(&tmp.path().join("tmp")));

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            saw_failed |= matches!(event, DumpEvent::Failed { .. });
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_failed_hook_removes_work_dir() {
        let tmp = TempDir::new().unwrap();
        let repo = fixture().with_collection(
            serde_json::from_value(json!({"name": "orphan_view", "dumpRules": "required", "customDump": true}))
                .unwrap(),
            Vec::new(),
        );
        // Delegates everything except `custom_dump`, which keeps the trait default
        struct NoHooks(MemoryRepository);

        #[async_trait::async_trait]
        impl Repository for NoHooks {
            fn dialect(&self) -> &str {
                self.0.dialect()
            }
            fn config_flags(&self) -> BTreeMap<String, Value> {
                self.0.config_flags()
            }
            async fn collections(&self) -> Result<Vec<CollectionInfo>> {
                self.0.collections().await
            }
            fn rows<'a>(
                &'a self,
                collection: &'a CollectionInfo,
                parent_only: bool,
            ) -> futures_util::stream::BoxStream<'a, Result<crate::repository::Row>> {
                self.0.rows(collection, parent_only)
            }
            async fn sequence_state(&self, collection: &CollectionInfo, field: &str) -> Result<Option<Map<String, Value>>> {
                self.0.sequence_state(collection, field).await
            }
            async fn execute_raw(&self, sql: &str) -> Result<Vec<crate::repository::Row>> {
                self.0.execute_raw(sql).await
            }
        }

        let storage = BackupStorage::new(tmp.path().join("backups"), "tego", Duration::from_secs(7200));
        let settings = DumpSettings {
            tmp_dir: tmp.path().join("tmp"),
            app_version: "1.0.0".to_string(),
            pack_tick: Duration::from_millis(10),
            pack_worst_case: Duration::from_secs(600),
        };
        let engine = DumpEngine::new(Arc::new(NoHooks(repo)), storage, settings);

        let err = engine.dump(request(&[], "backup_h.tego")).await.unwrap_err();
        assert!(matches!(err, DumpError::Repository(_)));
        assert!(is_empty_or_missing(&tmp.path().join("tmp")));
        assert!(!tmp.path().join("backups/backup_h.tego").exists());
    }

    #[tokio::test]
    async fn test_parent_only_rows_for_inherited_collections() {
        let tmp = TempDir::new().unwrap();
        let repo = MemoryRepository::new("postgres")
            .with_collection(
                serde_json::from_value(json!({
                    "name": "animals",
                    "dumpRules": "required",
                    "attributes": [{"name": "id", "type": "integer"}]
                }))
                .unwrap(),
                vec![json!({"id": 1}).as_object().cloned().unwrap()],
            )
            .with_collection(
                serde_json::from_value(json!({
                    "name": "dogs",
                    "dumpRules": "required",
                    "inherits": ["animals"],
                    "attributes": [{"name": "id", "type": "integer"}, {"name": "breed", "type": "string"}]
                }))
                .unwrap(),
                vec![json!({"id": 2, "breed": "corgi"}).as_object().cloned().unwrap()],
            );
        let engine = engine(tmp.path(), repo);
        let output = engine.dump(request(&[], "backup_i.tego")).await.unwrap();

        assert_eq!(read_entry(&output.file_path, "collections/animals/data"), "[1]\n");
        assert_eq!(read_entry(&output.file_path, "collections/dogs/data"), "[2,\"corgi\"]\n");

        let dogs_meta = read_json(&output.file_path, "collections/dogs/meta");
        assert_eq!(dogs_meta["inherits"], json!(["animals"]));
    }

    #[tokio::test]
    async fn test_dump_collection_by_name() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());
        let work_dir = WorkDir::create(tmp.path()).await.unwrap();

        let meta = engine.dump_collection(&work_dir, "users").await.unwrap();
        assert_eq!(meta.row_count, 2);
        assert!(work_dir.collection_dir("users").join(DATA_FILE).exists());

        let missing = engine.dump_collection(&work_dir, "nope").await;
        assert!(matches!(missing, Err(DumpError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_collection_name_cannot_escape_work_dir() {
        let tmp = TempDir::new().unwrap();
        let repo = MemoryRepository::new("sqlite").with_collection(
            serde_json::from_value(json!({"name": "../../evil", "attributes": [{"name": "id", "type": "integer"}]}))
                .unwrap(),
            vec![json!({"id": 1}).as_object().cloned().unwrap()],
        );
        let engine = engine(tmp.path(), repo);
        let work_dir = WorkDir::create(&tmp.path().join("tmp")).await.unwrap();

        let err = engine.dump_collection(&work_dir, "../../evil").await.unwrap_err();
        assert!(matches!(err, DumpError::Config { .. }));
        assert!(!tmp.path().join("evil").exists());
        assert!(!tmp.path().join("tmp/evil").exists());
    }

    #[tokio::test]
    async fn test_existing_archive_is_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());
        std::fs::create_dir_all(tmp.path().join("backups")).unwrap();
        std::fs::write(tmp.path().join("backups/backup_j.tego"), b"previous").unwrap();

        let err = engine.dump(request(&[], "backup_j.tego")).await.unwrap_err();
        assert!(matches!(err, DumpError::InvalidFileName(_)));
        assert_eq!(std::fs::read(tmp.path().join("backups/backup_j.tego")).unwrap(), b"previous");
    }

    #[tokio::test]
    async fn test_sub_app_archives_and_listing() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());

        let output = engine
            .dump(DumpRequest {
                app_name: Some("crm".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(output.dirname, tmp.path().join("backups/crm"));
        assert!(output.file_name.starts_with("backup_") && output.file_name.ends_with(".tego"));

        let listed = engine.all_backup_file_paths(Some("crm"), false).await.unwrap();
        assert_eq!(listed, vec![output.file_path.clone()]);

        let status = engine
            .get_file_status(&output.file_name, Some("crm"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.label(), "ok");
        assert!(engine.get_lock_file(&output.file_name, Some("crm")).await.is_none());
    }

    #[tokio::test]
    async fn test_dumpable_collections_grouped() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(tmp.path(), fixture());

        let grouped = engine.dumpable_collections_grouped().await.unwrap();
        let groups: Vec<&String> = grouped.keys().collect();
        assert_eq!(groups, vec!["required", "skipped", "third-party", "user"]);
        assert_eq!(grouped["user"].len(), 2);
    }
}
