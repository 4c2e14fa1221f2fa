//! Typed views over the opaque JSON metadata documents stored on assets.
//!
//! The database layer treats metadata as an ordered bag of JSON keys. This
//! module names the keys the rest of the crate relies on: asset kinds,
//! container documents, component entries and the scheduling sub-schema.
//! Parsing is tolerant throughout so that hand-edited or older documents
//! degrade to defaults instead of failing an operation.

pub mod container;
pub mod schedule;

pub use container::{
    build_linked_component_entry, container_display_name, AttachmentEntry, ComponentEntry,
    ComponentKind, ContainerMetadata, LinkEntry, LinkImport, LinkedFromEntry,
};
pub use schedule::{
    apply_container_schedule, get_container_schedule, ContactEntry, ContainerSchedule,
    ExternalLink, PrintedStatus, PriorityLevel, CONTAINER_SCHEDULE_KEY,
};

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordered JSON object, the shape of every stored metadata document.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Top-level classification of an asset row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    File,
    Container,
    Placeholder,
}

impl AssetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::File => "file",
            AssetKind::Container => "container",
            AssetKind::Placeholder => "placeholder",
        }
    }

    pub fn parse(value: &str) -> Option<AssetKind> {
        match value.trim().to_lowercase().as_str() {
            "file" => Some(AssetKind::File),
            "container" => Some(AssetKind::Container),
            "placeholder" => Some(AssetKind::Placeholder),
            _ => None,
        }
    }

    /// Kind recorded in `metadata`, defaulting to [`AssetKind::File`] when
    /// the key is absent or unrecognized.
    pub fn from_metadata(metadata: &JsonMap) -> AssetKind {
        metadata
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(AssetKind::parse)
            .unwrap_or(AssetKind::File)
    }
}

/// Whether `metadata` describes a container asset. The explicit kind wins;
/// older documents are recognized by a `container_path` or a non-empty
/// component list.
pub fn is_container_metadata(metadata: &JsonMap) -> bool {
    if AssetKind::from_metadata(metadata) == AssetKind::Container {
        return true;
    }
    if metadata
        .get("container_path")
        .and_then(|v| v.as_str())
        .is_some_and(|path| !path.trim().is_empty())
    {
        return true;
    }
    metadata
        .get("components")
        .and_then(|v| v.as_array())
        .is_some_and(|entries| !entries.is_empty())
}

pub fn is_container_asset(asset: &crate::db::Asset) -> bool {
    is_container_metadata(&asset.metadata)
}

/// Assemble the normalized core metadata document for an asset produced by
/// an importer or a customization run.
///
/// `original_path` falls back to `source` and `size` is read from
/// `managed_path` when not supplied. Timestamp pairs with empty values are
/// skipped; `extra` keys are merged last and may override the core fields.
pub fn build_asset_metadata(
    source: &str,
    source_type: &str,
    managed_path: &Path,
    original_path: Option<&str>,
    size: Option<u64>,
    timestamps: &[(&str, String)],
    extra: Option<&JsonMap>,
) -> Result<JsonMap> {
    let resolved_size = match size {
        Some(size) => size,
        None => fs::metadata(managed_path)
            .map_err(|e| Error::io(managed_path, e))?
            .len(),
    };

    let mut metadata = JsonMap::new();
    metadata.insert("source".to_string(), serde_json::json!(source));
    metadata.insert("source_type".to_string(), serde_json::json!(source_type));
    metadata.insert(
        "original_path".to_string(),
        serde_json::json!(original_path.unwrap_or(source)),
    );
    metadata.insert(
        "managed_path".to_string(),
        serde_json::json!(managed_path.to_string_lossy()),
    );
    metadata.insert("size".to_string(), serde_json::json!(resolved_size));

    for (key, value) in timestamps {
        if !value.is_empty() {
            metadata.insert((*key).to_string(), serde_json::json!(value));
        }
    }

    if let Some(extra) = extra {
        for (key, value) in extra {
            metadata.insert(key.clone(), value.clone());
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn asset_kind_defaults_to_file() {
        let mut metadata = JsonMap::new();
        assert_eq!(AssetKind::from_metadata(&metadata), AssetKind::File);

        metadata.insert("kind".to_string(), serde_json::json!("  Container "));
        assert_eq!(AssetKind::from_metadata(&metadata), AssetKind::Container);

        metadata.insert("kind".to_string(), serde_json::json!("mystery"));
        assert_eq!(AssetKind::from_metadata(&metadata), AssetKind::File);
    }

    #[test]
    fn container_detection_accepts_legacy_shapes() {
        let mut metadata = JsonMap::new();
        assert!(!is_container_metadata(&metadata));

        metadata.insert("container_path".to_string(), serde_json::json!("/lib/a"));
        assert!(is_container_metadata(&metadata));

        let mut by_components = JsonMap::new();
        by_components.insert("components".to_string(), serde_json::json!([{"path": "x"}]));
        assert!(is_container_metadata(&by_components));

        let mut empty_components = JsonMap::new();
        empty_components.insert("components".to_string(), serde_json::json!([]));
        assert!(!is_container_metadata(&empty_components));
    }

    #[test]
    fn build_asset_metadata_fills_core_fields() {
        let dir = tempfile::tempdir().unwrap();
        let managed = dir.path().join("part.stl");
        let mut file = std::fs::File::create(&managed).unwrap();
        file.write_all(b"solid part").unwrap();

        let mut extra = JsonMap::new();
        extra.insert("suffix".to_string(), serde_json::json!(".stl"));

        let metadata = build_asset_metadata(
            "/downloads/part.stl",
            "local",
            &managed,
            None,
            None,
            &[("imported_at", "2026-01-02T03:04:05Z".to_string()), ("noted_at", String::new())],
            Some(&extra),
        )
        .unwrap();

        assert_eq!(metadata.get("source"), Some(&serde_json::json!("/downloads/part.stl")));
        assert_eq!(metadata.get("source_type"), Some(&serde_json::json!("local")));
        assert_eq!(
            metadata.get("original_path"),
            Some(&serde_json::json!("/downloads/part.stl"))
        );
        assert_eq!(metadata.get("size"), Some(&serde_json::json!(10)));
        assert_eq!(
            metadata.get("imported_at"),
            Some(&serde_json::json!("2026-01-02T03:04:05Z"))
        );
        // Empty timestamp values are dropped.
        assert!(!metadata.contains_key("noted_at"));
        assert_eq!(metadata.get("suffix"), Some(&serde_json::json!(".stl")));
    }

    #[test]
    fn build_asset_metadata_fails_for_unreadable_size() {
        let err = build_asset_metadata(
            "src",
            "local",
            Path::new("/definitely/not/here.stl"),
            None,
            None,
            &[],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::Error::Io { .. }));
    }
}
