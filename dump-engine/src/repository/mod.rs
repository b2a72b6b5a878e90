//! Data-access contract the dump engine consumes.
//!
//! The engine never talks to a database directly. It enumerates collections,
//! streams rows, snapshots sequences, and hands hook-backed collections to
//! [`Repository::custom_dump`] through this trait.

pub mod memory;

use crate::utils::{DumpError, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use memory::MemoryRepository;

/// One row, keyed by attribute name
pub type Row = Map<String, Value>;

fn is_false(b: &bool) -> bool {
    !*b
}

/// Schema description of a single attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttrDescriptor {
    #[serde(rename = "type")]
    pub field_type: String,

    /// Underlying column name when it differs from the attribute name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_increment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(flatten)]
    pub descriptor: AttrDescriptor,
}

/// A collection as the repository describes it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    pub name: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub table_name: Option<String>,

    /// Plugin or module that declared the collection
    #[serde(default)]
    pub origin: Option<String>,

    /// Created by an end user rather than shipped by a plugin
    #[serde(default)]
    pub user_defined: bool,

    /// Raw `dumpRules` option, validated by the engine
    #[serde(default)]
    pub dump_rules: Option<Value>,

    /// Parent collections this one inherits rows from
    #[serde(default)]
    pub inherits: Vec<String>,

    #[serde(default)]
    pub is_view: bool,

    /// The collection type supplies its own dump hook
    #[serde(default)]
    pub custom_dump: bool,

    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl CollectionInfo {
    pub fn table_name(&self) -> &str {
        self.table_name.as_deref().unwrap_or(&self.name)
    }

    pub fn columns(&self) -> Vec<String> {
        self.attributes.iter().map(|a| a.name.clone()).collect()
    }

    /// Auto-incrementing primary key attribute, if any
    pub fn auto_increment_key(&self) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.descriptor.primary_key && a.descriptor.auto_increment)
    }
}

/// Raw SQL recorded by a dump hook, tagged with the group it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlFragment {
    pub group: String,
    pub sql: Vec<String>,
}

/// Handed to [`Repository::custom_dump`]
#[derive(Debug)]
pub struct DumpHookContext {
    work_dir: PathBuf,
    group: String,
    sql_content: BTreeMap<String, SqlFragment>,
}

impl DumpHookContext {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            group: String::new(),
            sql_content: BTreeMap::new(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Group of the collection whose hook is currently running
    pub fn group(&self) -> &str {
        &self.group
    }

    pub(crate) fn set_group(&mut self, group: &str) {
        self.group = group.to_string();
    }

    /// Record a raw statement under `key` for the current group
    pub fn add_sql(&mut self, key: impl Into<String>, sql: impl Into<String>) {
        let group = self.group.clone();
        self.sql_content
            .entry(key.into())
            .or_insert_with(|| SqlFragment {
                group,
                sql: Vec::new(),
            })
            .sql
            .push(sql.into());
    }

    pub fn into_sql_content(self) -> BTreeMap<String, SqlFragment> {
        self.sql_content
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Database dialect, e.g. `postgres`
    fn dialect(&self) -> &str;

    /// Connection-level flags that affect how a dump restores
    /// (table prefix, schema, underscored naming, ...)
    fn config_flags(&self) -> BTreeMap<String, Value>;

    async fn collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Stream every row of a collection. With `parent_only`, rows that
    /// physically belong to inheriting child collections are excluded.
    fn rows<'a>(&'a self, collection: &'a CollectionInfo, parent_only: bool) -> BoxStream<'a, Result<Row>>;

    /// Current state of the sequence behind an auto-increment field
    async fn sequence_state(&self, collection: &CollectionInfo, field: &str) -> Result<Option<Map<String, Value>>>;

    /// Run a raw statement inside a transaction.
    ///
    /// The engine never calls this itself; it is here for `custom_dump`
    /// implementations that need driver-specific statements.
    async fn execute_raw(&self, sql: &str) -> Result<Vec<Row>>;

    /// Type-declared dump hook for collections with `custom_dump` set
    async fn custom_dump(&self, collection: &CollectionInfo, _ctx: &mut DumpHookContext) -> Result<()> {
        Err(DumpError::repository(format!(
            "collection {} declares a custom dump but the repository has no hook for it",
            collection.name
        )))
    }
}

/// Per-field-type conversion applied to every value before it is written
pub trait ValueSerializer: Send + Sync {
    fn serialize(&self, attr: &AttrDescriptor, value: Value) -> Value;
}

/// Writes values as the repository produced them
#[derive(Debug, Default, Clone, Copy)]
pub struct RawValueSerializer;

impl ValueSerializer for RawValueSerializer {
    fn serialize(&self, _attr: &AttrDescriptor, value: Value) -> Value {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_info_from_json() {
        let info: CollectionInfo = serde_json::from_value(json!({
            "name": "orders",
            "tableName": "t_orders",
            "dumpRules": {"group": "user"},
            "attributes": [
                {"name": "id", "type": "bigInt", "primaryKey": true, "autoIncrement": true},
                {"name": "total", "type": "decimal"}
            ]
        }))
        .unwrap();

        assert_eq!(info.table_name(), "t_orders");
        assert_eq!(info.columns(), vec!["id", "total"]);
        assert_eq!(info.auto_increment_key().unwrap().name, "id");
        assert!(!info.custom_dump);
    }

    #[test]
    fn test_hook_context_groups_sql() {
        let mut ctx = DumpHookContext::new("/tmp/work");
        ctx.set_group("user");
        ctx.add_sql("orders_view", "CREATE VIEW a AS SELECT 1");
        ctx.add_sql("orders_view", "COMMENT ON VIEW a IS 'x'");
        ctx.set_group("required");
        ctx.add_sql("users_view", "CREATE VIEW b AS SELECT 2");

        let content = ctx.into_sql_content();
        assert_eq!(content["orders_view"].group, "user");
        assert_eq!(content["orders_view"].sql.len(), 2);
        assert_eq!(content["users_view"].group, "required");
    }
}
