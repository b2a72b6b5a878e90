//! Metadata files written into the work directory.
//!
//! `collections/<name>/meta` holds one [`CollectionDumpMeta`]; the top-level
//! `meta` holds the [`Manifest`].

use super::collections::DumpableCollection;
use crate::repository::AttrDescriptor;
use crate::utils::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub const META_FILE: &str = "meta";
pub const DATA_FILE: &str = "data";
pub const SQL_CONTENT_FILE: &str = "sql-content.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoIncrementMeta {
    pub field_name: String,
    #[serde(flatten)]
    pub sequence: Map<String, Value>,
}

/// Per-collection metadata, written after the data file is complete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDumpMeta {
    pub name: String,
    pub table_name: String,
    /// Lines in the data file
    pub row_count: u64,
    pub columns: Vec<String>,
    pub attributes: BTreeMap<String, AttrDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_increment: Option<AutoIncrementMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub dialect: String,
    pub db_config_flags: BTreeMap<String, Value>,
    pub grouped_collections: BTreeMap<String, Vec<DumpableCollection>>,
    pub dumped_groups: Vec<String>,
    pub delay_restore_collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect_only: Option<bool>,
    pub created_at: DateTime<Utc>,

    /// Caller-supplied fields merged into the top level
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Pretty-printed JSON, overwriting `path`
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, body).await?;
    Ok(())
}
