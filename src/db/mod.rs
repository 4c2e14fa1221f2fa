//! Asset metadata persistence: storage engine, schema, repository and the
//! record types they return.

pub mod repository;
pub mod schema;
pub mod storage;

pub use repository::AssetRepository;
pub use storage::StorageEngine;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::metadata::JsonMap;

/// In-memory representation of an asset row plus its tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Asset {
    pub id: i64,
    pub path: String,
    pub label: String,
    /// Open JSON document. Malformed stored payloads degrade to an empty
    /// document on load instead of failing the whole asset.
    pub metadata: JsonMap,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for [`AssetRepository::update_asset`]. `None` fields leave
/// the stored value untouched; to clear metadata or tags, pass an empty
/// document or slice.
#[derive(Debug, Clone, Default)]
pub struct AssetUpdate {
    pub path: Option<String>,
    pub label: Option<String>,
    pub metadata: Option<JsonMap>,
    pub tags: Option<Vec<String>>,
}

impl AssetUpdate {
    pub fn metadata(metadata: JsonMap) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::default()
        }
    }

    pub fn tags(tags: Vec<String>) -> Self {
        Self {
            tags: Some(tags),
            ..Self::default()
        }
    }

    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }
}

/// Named snapshot of a container's metadata document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerVersion {
    pub id: i64,
    pub container_asset_id: i64,
    pub name: String,
    pub metadata: JsonMap,
    pub notes: Option<String>,
    pub source_version_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A recorded parameter set applied to a base asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Customization {
    pub id: i64,
    pub base_asset_id: i64,
    pub backend_identifier: String,
    pub parameter_schema: JsonMap,
    pub parameter_values: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lineage edge linking a customization to one derivative asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetRelationship {
    pub id: i64,
    pub base_asset_id: i64,
    pub customization_id: i64,
    pub derivative_asset_id: i64,
    pub relationship_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Column encoding helpers shared by the repository
// ============================================================================

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(text: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(text) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(err) => {
            tracing::warn!("unparseable stored timestamp {text:?}: {err}");
            DateTime::<Utc>::UNIX_EPOCH
        }
    }
}

pub(crate) fn serialize_metadata(metadata: Option<&JsonMap>) -> String {
    match metadata {
        Some(map) => serde_json::Value::Object(map.clone()).to_string(),
        None => "{}".to_string(),
    }
}

/// Decode a stored metadata column, degrading to an empty document on any
/// malformed or non-object payload.
pub(crate) fn parse_metadata(raw: Option<String>) -> JsonMap {
    let Some(raw) = raw else {
        return JsonMap::new();
    };
    if raw.trim().is_empty() {
        return JsonMap::new();
    }
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            tracing::warn!(
                "stored metadata is not a JSON object (found {}); treating as empty",
                json_type_name(&other)
            );
            JsonMap::new()
        }
        Err(err) => {
            tracing::warn!("malformed stored metadata: {err}; treating as empty");
            JsonMap::new()
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
