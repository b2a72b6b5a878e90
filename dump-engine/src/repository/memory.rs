//! In-memory repository backed by a JSON snapshot.
//!
//! Used by the `tego-dump --fixture` flag and throughout the tests. Child
//! collections that `inherits` a parent contribute their rows to the
//! parent's unfiltered row stream, the way table inheritance behaves in a
//! database that supports it.

use super::{CollectionInfo, DumpHookContext, Repository, Row};
use crate::utils::{DumpError, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCollection {
    #[serde(flatten)]
    pub info: CollectionInfo,

    #[serde(default)]
    pub rows: Vec<Row>,

    /// Sequence snapshot returned for the auto-increment key
    #[serde(default)]
    pub sequence: Option<Map<String, Value>>,

    /// Statements the custom dump hook records for this collection
    #[serde(default)]
    pub view_sql: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    #[serde(default = "default_dialect")]
    pub dialect: String,

    #[serde(default)]
    pub config_flags: BTreeMap<String, Value>,

    #[serde(default)]
    pub collections: Vec<MemoryCollection>,

    /// Canned results for `execute_raw`, keyed by exact statement text
    #[serde(default)]
    pub raw_results: HashMap<String, Vec<Row>>,
}

fn default_dialect() -> String {
    "sqlite".to_string()
}

pub struct MemoryRepository {
    snapshot: MemorySnapshot,
    executed: Mutex<Vec<String>>,
}

impl MemoryRepository {
    pub fn new(dialect: impl Into<String>) -> Self {
        Self::from_snapshot(MemorySnapshot {
            dialect: dialect.into(),
            config_flags: BTreeMap::new(),
            collections: Vec::new(),
            raw_results: HashMap::new(),
        })
    }

    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            snapshot,
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Load a snapshot from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: MemorySnapshot = serde_json::from_str(&content)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.snapshot.config_flags.insert(key.into(), value);
        self
    }

    pub fn with_collection(mut self, info: CollectionInfo, rows: Vec<Row>) -> Self {
        self.snapshot.collections.push(MemoryCollection {
            info,
            rows,
            ..Default::default()
        });
        self
    }

    pub fn with_memory_collection(mut self, collection: MemoryCollection) -> Self {
        self.snapshot.collections.push(collection);
        self
    }

    pub fn with_raw_result(mut self, sql: impl Into<String>, rows: Vec<Row>) -> Self {
        self.snapshot.raw_results.insert(sql.into(), rows);
        self
    }

    /// Statements passed to `execute_raw` so far
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn find(&self, name: &str) -> Option<&MemoryCollection> {
        self.snapshot.collections.iter().find(|c| c.info.name == name)
    }

    /// Names of every collection that inherits from `name`, transitively
    fn descendants(&self, name: &str) -> Vec<&MemoryCollection> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![name.to_string()];

        while let Some(parent) = pending.pop() {
            for child in &self.snapshot.collections {
                if child.info.inherits.iter().any(|p| *p == parent) && seen.insert(child.info.name.clone()) {
                    pending.push(child.info.name.clone());
                    found.push(child);
                }
            }
        }
        found
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn dialect(&self) -> &str {
        &self.snapshot.dialect
    }

    fn config_flags(&self) -> BTreeMap<String, Value> {
        self.snapshot.config_flags.clone()
    }

    async fn collections(&self) -> Result<Vec<CollectionInfo>> {
        Ok(self.snapshot.collections.iter().map(|c| c.info.clone()).collect())
    }

    fn rows<'a>(&'a self, collection: &'a CollectionInfo, parent_only: bool) -> BoxStream<'a, Result<Row>> {
        let Some(own) = self.find(&collection.name) else {
            let err = DumpError::NotFound(format!("collection {}", collection.name));
            return stream::once(async move { Err(err) }).boxed();
        };

        let inherited: Vec<&MemoryCollection> = if parent_only {
            Vec::new()
        } else {
            self.descendants(&collection.name)
        };

        // A parent scan only sees the parent's columns of child rows
        let columns: Vec<&str> = collection.attributes.iter().map(|a| a.name.as_str()).collect();
        let child_rows = inherited.into_iter().flat_map(|child| child.rows.iter()).map(move |row| {
            let projected: Row = columns
                .iter()
                .filter_map(|c| row.get(*c).map(|v| (c.to_string(), v.clone())))
                .collect();
            Ok::<Row, DumpError>(projected)
        });

        stream::iter(own.rows.iter().cloned().map(Ok::<Row, DumpError>).chain(child_rows)).boxed()
    }

    async fn sequence_state(&self, collection: &CollectionInfo, _field: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.find(&collection.name).and_then(|c| c.sequence.clone()))
    }

    async fn execute_raw(&self, sql: &str) -> Result<Vec<Row>> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }
        self.snapshot
            .raw_results
            .get(sql)
            .cloned()
            .ok_or_else(|| DumpError::repository(format!("unsupported statement: {}", sql)))
    }

    async fn custom_dump(&self, collection: &CollectionInfo, ctx: &mut DumpHookContext) -> Result<()> {
        let own = self
            .find(&collection.name)
            .ok_or_else(|| DumpError::NotFound(format!("collection {}", collection.name)))?;
        for sql in &own.view_sql {
            ctx.add_sql(collection.name.clone(), sql.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use serde_json::json;

    fn info(value: Value) -> CollectionInfo {
        serde_json::from_value(value).unwrap()
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn inheritance_repo() -> MemoryRepository {
        MemoryRepository::new("postgres")
            .with_collection(
                info(json!({"name": "animals", "attributes": [{"name": "id", "type": "integer"}]})),
                vec![row(json!({"id": 1}))],
            )
            .with_collection(
                info(json!({
                    "name": "dogs",
                    "inherits": ["animals"],
                    "attributes": [{"name": "id", "type": "integer"}, {"name": "breed", "type": "string"}]
                })),
                vec![row(json!({"id": 2, "breed": "corgi"}))],
            )
            .with_collection(
                info(json!({"name": "puppies", "inherits": ["dogs"], "attributes": [{"name": "id", "type": "integer"}]})),
                vec![row(json!({"id": 3}))],
            )
    }

    #[tokio::test]
    async fn test_parent_scan_includes_children() {
        let repo = inheritance_repo();
        let animals = repo.find("animals").unwrap().info.clone();

        let all: Vec<Row> = repo.rows(&animals, false).try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|r| !r.contains_key("breed")));

        let own: Vec<Row> = repo.rows(&animals, true).try_collect().await.unwrap();
        assert_eq!(own, vec![row(json!({"id": 1}))]);
    }

    #[tokio::test]
    async fn test_unknown_collection_stream_errors() {
        let repo = MemoryRepository::new("sqlite");
        let ghost = info(json!({"name": "ghost"}));
        let result: Result<Vec<Row>> = repo.rows(&ghost, false).try_collect().await;
        assert!(matches!(result, Err(DumpError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_execute_raw_records_statements() {
        let repo = MemoryRepository::new("sqlite").with_raw_result("SELECT 1", vec![row(json!({"1": 1}))]);

        assert_eq!(repo.execute_raw("SELECT 1").await.unwrap().len(), 1);
        assert!(repo.execute_raw("DROP TABLE x").await.is_err());
        assert_eq!(repo.executed(), vec!["SELECT 1", "DROP TABLE x"]);
    }

    #[tokio::test]
    async fn test_snapshot_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(
            &path,
            json!({
                "dialect": "postgres",
                "configFlags": {"DB_SCHEMA": "public"},
                "collections": [
                    {
                        "name": "order_summary",
                        "isView": true,
                        "customDump": true,
                        "viewSql": ["CREATE VIEW order_summary AS SELECT 1"]
                    }
                ]
            })
            .to_string(),
        )
        .unwrap();

        let repo = MemoryRepository::from_json_file(&path).unwrap();
        assert_eq!(repo.dialect(), "postgres");
        assert_eq!(repo.config_flags()["DB_SCHEMA"], "public");

        let view = repo.collections().await.unwrap().remove(0);
        let mut ctx = DumpHookContext::new(dir.path());
        ctx.set_group("required");
        repo.custom_dump(&view, &mut ctx).await.unwrap();
        let sql = ctx.into_sql_content();
        assert_eq!(sql["order_summary"].sql, vec!["CREATE VIEW order_summary AS SELECT 1"]);
    }
}
