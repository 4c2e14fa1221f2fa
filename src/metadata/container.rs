//! Container documents: the typed view over a container asset's metadata
//! and the entry structs recorded in its `components`, `files`, `links` and
//! `linked_from` arrays.
//!
//! Every entry struct carries a flattened `extra` bag, so keys this crate
//! does not know about survive a round trip through the typed form. The
//! top-level [`ContainerMetadata`] view parses tolerantly: malformed entries
//! are logged and skipped, and scalar keys with unexpected values stay in
//! `extra` instead of failing the document.

use std::path::Path;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Asset;
use crate::error::{Error, Result};
use crate::metadata::schedule::{self, ContainerSchedule};
use crate::metadata::{AssetKind, JsonMap};

/// Classification of a container component entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Component,
    Placeholder,
    LinkedComponent,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Component => "component",
            ComponentKind::Placeholder => "placeholder",
            ComponentKind::LinkedComponent => "linked_component",
        }
    }
}

/// Model file recorded in a container's `components` array. Entries produced
/// by a folder scan omit `kind`; linked entries carry
/// [`ComponentKind::LinkedComponent`] plus provenance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ComponentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_import_id: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl ComponentEntry {
    /// Provenance block for a linked component, when present and readable.
    pub fn link_import(&self) -> Option<LinkImport> {
        let value = self.metadata.as_ref()?.get("link_import")?;
        serde_json::from_value(value.clone()).ok()
    }
}

/// Non-model file recorded in a container's `files` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Entry in a container's `links` array. Covers both link files discovered
/// by a scan (virtual link descriptors and symlinks, which carry `target`
/// and `link_type`) and container-to-container links (which carry `link_id`,
/// `target_container_id` and the denormalized target fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// Marker string (`"link"`) on container-to-container entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_container_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version_created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Reciprocal entry in the target container's `linked_from` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkedFromEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_container_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version_created_at: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Provenance embedded in a linked component's `metadata.link_import`,
/// tracing the entry back to the container it was imported from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkImport {
    pub link_import_id: String,
    pub source_container_id: i64,
    pub source_container_path: String,
    pub source_container_label: String,
    pub source_component_path: String,
    pub source_component_label: String,
    pub source_component_relative_path: Option<String>,
    pub source_asset_id: Option<i64>,
    pub linked_at: String,
}

/// Build a `linked_component` entry referencing a model from another
/// container, with fresh provenance so later scans and edits can trace it.
pub fn build_linked_component_entry(
    source_component: &ComponentEntry,
    source_container: &Asset,
    override_label: Option<&str>,
) -> Result<ComponentEntry> {
    let path_text = source_component
        .path
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_string();
    if path_text.is_empty() {
        return Err(Error::validation("source component is missing a path"));
    }

    let mut label = override_label
        .or(source_component.label.as_deref())
        .unwrap_or("")
        .trim()
        .to_string();
    if label.is_empty() {
        label = Path::new(&path_text)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_text.clone());
    }

    let relative_path = source_component
        .relative_path
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let link_import_id = Uuid::new_v4().to_string();
    let provenance = LinkImport {
        link_import_id: link_import_id.clone(),
        source_container_id: source_container.id,
        source_container_path: source_container.path.clone(),
        source_container_label: container_display_name(source_container),
        source_component_path: path_text.clone(),
        source_component_label: label.clone(),
        source_component_relative_path: relative_path.clone(),
        source_asset_id: source_component.asset_id,
        linked_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
    };

    let mut metadata = source_component.metadata.clone().unwrap_or_default();
    metadata.insert("link_import".to_string(), serde_json::to_value(&provenance)?);

    Ok(ComponentEntry {
        path: Some(path_text),
        label: Some(label),
        asset_id: source_component.asset_id,
        kind: Some(ComponentKind::LinkedComponent),
        metadata: Some(metadata),
        link_import_id: Some(link_import_id),
        relative_path,
        suffix: source_component
            .suffix
            .clone()
            .filter(|suffix| !suffix.is_empty()),
        ..ComponentEntry::default()
    })
}

/// Best label for a container: its `display_name`, then the row label, then
/// the folder name.
pub fn container_display_name(asset: &Asset) -> String {
    if let Some(name) = asset
        .metadata
        .get("display_name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        return name.to_string();
    }
    if !asset.label.is_empty() {
        return asset.label.clone();
    }
    Path::new(&asset.path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| asset.path.clone())
}

/// Read-only typed view over a container asset's metadata document.
///
/// Persistence flows mutate the raw [`JsonMap`] so they never drop keys;
/// this view is for consumers that want the known shape without poking at
/// JSON values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerMetadata {
    pub kind: Option<AssetKind>,
    pub container_type: Option<String>,
    pub display_name: Option<String>,
    pub container_path: Option<String>,
    pub component_count: Option<u64>,
    pub components: Vec<ComponentEntry>,
    pub files: Vec<AttachmentEntry>,
    pub links: Vec<LinkEntry>,
    pub linked_from: Vec<LinkedFromEntry>,
    /// Scheduling block stored under the `container_metadata` key.
    pub schedule: Option<ContainerSchedule>,
    /// Every key the view does not model, in document order.
    pub extra: JsonMap,
}

impl ContainerMetadata {
    pub fn from_map(document: &JsonMap) -> ContainerMetadata {
        let mut extra = document.clone();

        // An unrecognized kind string stays in the bag instead of vanishing.
        let kind = match extra.remove("kind") {
            Some(value) => {
                let parsed = value.as_str().and_then(AssetKind::parse);
                if parsed.is_none() {
                    extra.insert("kind".to_string(), value);
                }
                parsed
            }
            None => None,
        };

        let container_type = take_string(&mut extra, "container_type");
        let display_name = take_string(&mut extra, "display_name");
        let container_path = take_string(&mut extra, "container_path");
        let component_count = match extra.remove("component_count") {
            Some(value) => {
                let parsed = value.as_u64();
                if parsed.is_none() {
                    extra.insert("component_count".to_string(), value);
                }
                parsed
            }
            None => None,
        };

        let components = take_entries(&mut extra, "components");
        let files = take_entries(&mut extra, "files");
        let links = take_entries(&mut extra, "links");
        let linked_from = take_entries(&mut extra, "linked_from");

        let schedule = extra
            .remove(schedule::CONTAINER_SCHEDULE_KEY)
            .and_then(|value| value.as_object().map(ContainerSchedule::from_map));

        ContainerMetadata {
            kind,
            container_type,
            display_name,
            container_path,
            component_count,
            components,
            files,
            links,
            linked_from,
            schedule,
            extra,
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind == Some(AssetKind::Container)
            || self
                .container_path
                .as_deref()
                .is_some_and(|path| !path.trim().is_empty())
            || !self.components.is_empty()
    }

    /// Components flagged as linked imports.
    pub fn linked_components(&self) -> impl Iterator<Item = &ComponentEntry> {
        self.components
            .iter()
            .filter(|entry| entry.kind == Some(ComponentKind::LinkedComponent))
    }
}

fn take_string(extra: &mut JsonMap, key: &str) -> Option<String> {
    match extra.remove(key) {
        Some(value) => match value.as_str() {
            Some(text) => Some(text.to_string()),
            None => {
                extra.insert(key.to_string(), value);
                None
            }
        },
        None => None,
    }
}

fn take_entries<T: DeserializeOwned>(extra: &mut JsonMap, key: &str) -> Vec<T> {
    let Some(value) = extra.remove(key) else {
        return Vec::new();
    };
    let items = match value {
        serde_json::Value::Array(items) => items,
        // A bare object counts as a single-entry list.
        serde_json::Value::Object(_) => vec![value],
        other => {
            extra.insert(key.to_string(), other);
            return Vec::new();
        }
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("skipping malformed {key} entry: {e}");
                None
            }
        })
        .collect()
}
