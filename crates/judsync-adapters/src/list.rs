use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::RegistryError;

/// One or many identifiers under a single key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum IdSet {
    Many(Vec<String>),
    One(String),
}

impl IdSet {
    fn into_vec(self) -> Vec<String> {
        match self {
            IdSet::Many(ids) => ids,
            IdSet::One(id) => vec![id],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatedGroup {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(alias = "ids")]
    pub list: IdSet,
}

/// Every list shape the registry has been seen to return. Variant order is
/// the match order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ListResponse {
    /// `"JID"`
    Single(String),
    /// `["JID", ...]`
    Bare(Vec<String>),
    /// `[{"date": "...", "list": [...]}, ...]`
    Dated(Vec<DatedGroup>),
    /// `{"date": "...", "list": [...]}`
    Group(DatedGroup),
    /// `{"2024-01-01": [...], ...}`
    Keyed(BTreeMap<String, IdSet>),
}

impl ListResponse {
    pub fn parse(raw: &JsonValue) -> Result<Self, RegistryError> {
        if let Some(message) = raw.get("error").and_then(JsonValue::as_str) {
            return Err(RegistryError::Remote(message.to_string()));
        }
        Self::deserialize(raw).map_err(|_| RegistryError::UnrecognizedListShape(shape_hint(raw)))
    }

    /// Identifiers in response order, before cleanup.
    pub fn into_ids(self) -> Vec<String> {
        match self {
            ListResponse::Single(id) => vec![id],
            ListResponse::Bare(ids) => ids,
            ListResponse::Dated(groups) => groups.into_iter().flat_map(|g| g.list.into_vec()).collect(),
            ListResponse::Group(group) => group.list.into_vec(),
            ListResponse::Keyed(by_date) => by_date.into_values().flat_map(IdSet::into_vec).collect(),
        }
    }
}

/// Flatten a raw list response into trimmed, non-empty, first-seen-unique
/// identifiers, keeping at most `limit`.
pub fn collect_ids(raw: &JsonValue, limit: usize) -> Result<Vec<String>, RegistryError> {
    let ids = ListResponse::parse(raw)?.into_ids();
    let mut seen = HashSet::new();
    Ok(ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.clone()))
        .take(limit)
        .collect())
}

fn shape_hint(raw: &JsonValue) -> String {
    let kind = match raw {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    };
    let mut preview = raw.to_string();
    if preview.chars().count() > 80 {
        preview = preview.chars().take(80).collect::<String>() + "...";
    }
    format!("{kind}: {preview}")
}
