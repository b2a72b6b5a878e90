//! Collection discovery and dump-group selection.

use crate::repository::CollectionInfo;
use crate::utils::{DumpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const GROUP_REQUIRED: &str = "required";
pub const GROUP_SKIPPED: &str = "skipped";
pub const GROUP_CUSTOM: &str = "custom";
pub const GROUP_UNKNOWN: &str = "unknown";

/// Parsed form of a collection's `dumpRules` option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpRules {
    Required,
    Skipped,
    Group { group: String, delay_restore: bool },
}

impl DumpRules {
    /// Accepts `"required"`, `"skipped"`, or `{"group": "...", "delayRestore": ...}`.
    pub fn parse(collection: &str, raw: &Value) -> Result<Self> {
        match raw {
            Value::String(s) if s == GROUP_REQUIRED => Ok(DumpRules::Required),
            Value::String(s) if s == GROUP_SKIPPED => Ok(DumpRules::Skipped),
            Value::String(s) => Err(DumpError::config(
                collection,
                format!("unknown rule {:?}, expected \"required\", \"skipped\" or {{group}}", s),
            )),
            Value::Object(map) => {
                let group = match map.get("group") {
                    Some(Value::String(g)) if !g.trim().is_empty() => g.trim().to_string(),
                    Some(other) => {
                        return Err(DumpError::config(
                            collection,
                            format!("group must be a non-empty string, got {}", other),
                        ))
                    }
                    None => return Err(DumpError::config(collection, "object rule is missing \"group\"")),
                };
                let delay_restore = match map.get("delayRestore") {
                    None | Some(Value::Null) => false,
                    Some(Value::Bool(b)) => *b,
                    Some(other) => {
                        return Err(DumpError::config(
                            collection,
                            format!("delayRestore must be a boolean, got {}", other),
                        ))
                    }
                };
                Ok(DumpRules::Group { group, delay_restore })
            }
            other => Err(DumpError::config(
                collection,
                format!("dump rules must be a string or an object, got {}", other),
            )),
        }
    }

    pub fn group(&self) -> &str {
        match self {
            DumpRules::Required => GROUP_REQUIRED,
            DumpRules::Skipped => GROUP_SKIPPED,
            DumpRules::Group { group, .. } => group,
        }
    }
}

/// A collection as listed to callers choosing what to dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpableCollection {
    pub name: String,
    pub title: Option<String>,
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub is_view: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delay_restore: bool,
    #[serde(skip)]
    pub custom_dump: bool,
}

impl DumpableCollection {
    /// Resolve a repository collection. Malformed rules are fatal.
    pub fn resolve(info: &CollectionInfo) -> Result<Self> {
        validate_collection_name(&info.name)?;
        let rules = info
            .dump_rules
            .as_ref()
            .map(|raw| DumpRules::parse(&info.name, raw))
            .transpose()?;

        let (group, delay_restore) = match rules {
            Some(DumpRules::Group { group, delay_restore }) => (group, delay_restore),
            Some(rule) => (rule.group().to_string(), false),
            None if info.user_defined => (GROUP_CUSTOM.to_string(), false),
            None => (GROUP_UNKNOWN.to_string(), false),
        };

        Ok(Self {
            name: info.name.clone(),
            title: info.title.clone(),
            group,
            origin: info.origin.clone(),
            is_view: info.is_view,
            inherits: info.inherits.clone(),
            delay_restore,
            custom_dump: info.custom_dump,
        })
    }
}

/// A collection name becomes a directory under the work dir, so it must be a
/// single plain path component.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DumpError::config(name, "collection name is empty"));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(DumpError::config(name, "collection name must be a single path component"));
    }
    Ok(())
}

/// Resolve every collection, failing on the first bad rule
pub fn resolve_all(infos: &[CollectionInfo]) -> Result<Vec<DumpableCollection>> {
    infos.iter().map(DumpableCollection::resolve).collect()
}

pub fn group_by_group(collections: &[DumpableCollection]) -> BTreeMap<String, Vec<DumpableCollection>> {
    let mut grouped: BTreeMap<String, Vec<DumpableCollection>> = BTreeMap::new();
    for collection in collections {
        grouped
            .entry(collection.group.clone())
            .or_default()
            .push(collection.clone());
    }
    grouped
}

/// Requested groups plus `required`; `skipped` never makes it in
pub fn normalize_groups<I, S>(groups: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set: BTreeSet<String> = groups
        .into_iter()
        .map(|g| g.as_ref().trim().to_string())
        .filter(|g| !g.is_empty() && g != GROUP_SKIPPED)
        .collect();
    set.insert(GROUP_REQUIRED.to_string());
    set
}

/// Collections whose group was selected, in repository order
pub fn select<'a>(collections: &'a [DumpableCollection], groups: &BTreeSet<String>) -> Vec<&'a DumpableCollection> {
    collections
        .iter()
        .filter(|c| c.group != GROUP_SKIPPED && groups.contains(&c.group))
        .collect()
}

/// Whether any other collection inherits from `name`
pub fn has_children(collections: &[CollectionInfo], name: &str) -> bool {
    collections.iter().any(|c| c.inherits.iter().any(|p| p == name))
}
