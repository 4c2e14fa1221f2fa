//! Container reconciliation: rebuild a container's component, file and link
//! metadata from the folder on disk while carrying forward everything a
//! local walk cannot rediscover.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::db::{Asset, AssetUpdate};
use crate::error::{Error, Result};
use crate::metadata::JsonMap;
use crate::service::AssetService;

/// Extension carried by virtual link descriptor files.
pub const VIRTUAL_LINK_EXTENSION: &str = "mvlink";

/// Caller-supplied knobs for a container scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Display name to apply to the container asset. `None` keeps whatever
    /// is stored, falling back to the folder name.
    pub display_name: Option<String>,
    /// Container type to apply. `None` keeps the stored value.
    pub container_type: Option<String>,
    /// Extensions treated as printable model components.
    pub model_extensions: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            display_name: None,
            container_type: None,
            model_extensions: crate::config::default_model_extensions(),
        }
    }
}

/// Result of one container reconciliation.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub folder: PathBuf,
    pub asset: Asset,
    pub component_count: usize,
}

/// True when the path's final component parses as a UUID.
pub fn is_container_folder(path: &Path) -> bool {
    match path.file_name().and_then(OsStr::to_str) {
        Some(name) => Uuid::parse_str(name).is_ok(),
        None => false,
    }
}

/// Rescan a container folder and persist its refreshed metadata.
///
/// Returns `Ok(None)` when the folder name is not a UUID, so bulk sweeps can
/// feed every directory through without pre-filtering. `existing` is the
/// container's current asset row if one is already stored; passing `None`
/// for a folder that already has a row fails with [`Error::DuplicatePath`].
///
/// The refreshed document is written in a single update: `components` and
/// `files` reflect the folder contents, `links` merges fresh discoveries
/// with previously persisted entries, and every `linked_component` entry
/// from the prior document is carried forward verbatim.
pub fn scan_container_folder(
    service: &AssetService,
    folder: &Path,
    existing: Option<&Asset>,
    options: &ScanOptions,
) -> Result<Option<ScanOutcome>> {
    let folder = fs::canonicalize(folder).map_err(|err| Error::io(folder, err))?;

    if !is_container_folder(&folder) {
        tracing::debug!(folder = %folder.display(), "skipping non-UUID folder during container scan");
        return Ok(None);
    }
    if !folder.is_dir() {
        return Err(Error::validation(format!(
            "container path {} is not a directory",
            folder.display()
        )));
    }

    let folder_text = folder.display().to_string();
    let name = folder
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_string();

    let container_asset = match existing {
        None => {
            let display_name = options
                .display_name
                .as_deref()
                .filter(|value| !value.is_empty())
                .unwrap_or(&name)
                .to_string();
            let mut seed = JsonMap::new();
            seed.insert("kind".to_string(), json!("container"));
            seed.insert(
                "container_type".to_string(),
                json!(options
                    .container_type
                    .as_deref()
                    .filter(|value| !value.is_empty())
                    .unwrap_or("container")),
            );
            seed.insert("display_name".to_string(), json!(display_name));
            seed.insert("container_path".to_string(), json!(folder_text));
            seed.insert("created_from_scan".to_string(), json!(true));
            service.create_asset(&folder_text, Some(&display_name), Some(&seed), None)?
        }
        Some(existing) => {
            let container_type = options
                .container_type
                .clone()
                .filter(|value| !value.is_empty())
                .or_else(|| read_string(&existing.metadata, "container_type"))
                .unwrap_or_else(|| "container".to_string());
            let display_name = options
                .display_name
                .clone()
                .filter(|value| !value.is_empty())
                .or_else(|| read_string(&existing.metadata, "display_name"))
                .unwrap_or_else(|| name.clone());
            let label = options
                .display_name
                .clone()
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| existing.label.clone());

            let mut updated = existing.metadata.clone();
            updated.insert("kind".to_string(), json!("container"));
            updated.insert("container_type".to_string(), json!(container_type));
            updated.insert("display_name".to_string(), json!(display_name));
            updated.insert("container_path".to_string(), json!(folder_text));
            updated.insert("updated_from_scan".to_string(), json!(true));
            service.update_asset(
                existing.id,
                AssetUpdate {
                    label: Some(label),
                    metadata: Some(updated),
                    ..AssetUpdate::default()
                },
            )?
        }
    };

    // Direct children only; nested containers compose through links.
    let mut entries: Vec<walkdir::DirEntry> = WalkDir::new(&folder)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    // Pass 1: PNGs that sit next to a model and share its stem are renders
    // of that model, not standalone attachments.
    let mut preview_images: BTreeSet<PathBuf> = BTreeSet::new();
    for entry in &entries {
        let path = entry.path();
        if !is_model_extension(&lowercase_extension(path), &options.model_extensions) {
            continue;
        }
        if !fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(OsStr::to_str) else {
            continue;
        };
        for sibling in &entries {
            let sibling_path = sibling.path();
            let Some(sibling_name) = sibling_path.file_name().and_then(OsStr::to_str) else {
                continue;
            };
            if sibling_name.starts_with(stem) && sibling_name.ends_with(".png") {
                preview_images.insert(sibling_path.to_path_buf());
            }
        }
    }

    // Pass 2: ensure an asset row per file and classify it. A broken child
    // is skipped so one bad file never aborts the whole refresh.
    let mut components: Vec<Value> = Vec::new();
    let mut attachments: Vec<Value> = Vec::new();
    let mut links: Vec<JsonMap> = Vec::new();
    let mut component_count = 0usize;

    for entry in &entries {
        let path = entry.path();
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable container entry");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };

        let path_text = path.display().to_string();
        let mut stub = JsonMap::new();
        stub.insert("created_from_scan".to_string(), json!(true));
        stub.insert("file_size".to_string(), json!(meta.len()));
        stub.insert("suffix".to_string(), json!(display_suffix(path)));
        let child_asset = service.ensure_asset(&path_text, Some(file_name), Some(&stub))?;

        let extension = lowercase_extension(path);
        if extension == "png" && preview_images.contains(path) {
            tracing::debug!(path = %path.display(), "skipping generated preview image");
            continue;
        }

        let relative = path.strip_prefix(&folder).unwrap_or(path);
        let mut item = JsonMap::new();
        item.insert("path".to_string(), json!(path_text));
        item.insert(
            "relative_path".to_string(),
            json!(relative.display().to_string()),
        );
        item.insert("asset_id".to_string(), json!(child_asset.id));
        item.insert("label".to_string(), json!(file_name));
        item.insert("file_size".to_string(), json!(meta.len()));
        item.insert("suffix".to_string(), json!(display_suffix(path)));

        if extension == VIRTUAL_LINK_EXTENSION {
            match load_virtual_link(path) {
                Some(link) => {
                    for (key, value) in link {
                        item.insert(key, value);
                    }
                    links.push(item);
                }
                None => {
                    tracing::debug!(path = %path.display(), "dropping unreadable or malformed virtual link");
                }
            }
        } else if entry.path_is_symlink() {
            match fs::read_link(path) {
                Ok(target) => {
                    item.insert("target".to_string(), json!(target.display().to_string()));
                    item.insert("link_type".to_string(), json!("symlink"));
                    links.push(item);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable symlink");
                }
            }
        } else if is_model_extension(&extension, &options.model_extensions) {
            components.push(Value::Object(item));
        } else {
            attachments.push(Value::Object(item));
        }
        component_count += 1;
    }

    // Linked components belong to other containers and are invisible to a
    // local walk; carry the stored entries over untouched.
    if let Some(existing) = existing {
        if let Some(Value::Array(prior)) = existing.metadata.get("components") {
            for entry in prior {
                let Some(map) = entry.as_object() else { continue };
                if map.get("kind").and_then(Value::as_str) == Some("linked_component") {
                    components.push(entry.clone());
                }
            }
        }
    }

    let preserved = existing
        .map(|asset| normalize_link_entries(asset.metadata.get("links")))
        .unwrap_or_default();
    let links = merge_link_entries(links, preserved);

    let mut updated = container_asset.metadata.clone();
    updated.insert("component_count".to_string(), json!(component_count));
    updated.insert("components".to_string(), Value::Array(components));
    updated.insert("files".to_string(), Value::Array(attachments));
    updated.insert(
        "links".to_string(),
        Value::Array(links.into_iter().map(Value::Object).collect()),
    );
    let asset = service.update_asset(container_asset.id, AssetUpdate::metadata(updated))?;

    tracing::debug!(
        folder = %folder.display(),
        components = component_count,
        "reconciled container folder"
    );

    Ok(Some(ScanOutcome {
        folder,
        asset,
        component_count,
    }))
}

/// Reconcile every UUID-named directory directly under `root`.
///
/// Non-container directories are left alone, and a folder whose scan fails
/// is logged and skipped so one bad container never aborts the sweep.
pub fn scan_library_root(
    service: &AssetService,
    root: &Path,
    options: &ScanOptions,
) -> Result<Vec<ScanOutcome>> {
    let root = fs::canonicalize(root).map_err(|err| Error::io(root, err))?;

    let mut folders: Vec<PathBuf> = WalkDir::new(&root)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .filter(|path| fs::metadata(path).map(|meta| meta.is_dir()).unwrap_or(false))
        .collect();
    folders.sort();

    let mut outcomes = Vec::new();
    for folder in folders {
        if !is_container_folder(&folder) {
            tracing::debug!(folder = %folder.display(), "skipping non-container directory");
            continue;
        }
        let refreshed = service
            .get_asset_by_path(&folder.display().to_string())
            .and_then(|existing| scan_container_folder(service, &folder, existing.as_ref(), options));
        match refreshed {
            Ok(Some(outcome)) => outcomes.push(outcome),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(folder = %folder.display(), error = %err, "container scan failed");
            }
        }
    }
    Ok(outcomes)
}

// ============================================================================
// Classification helpers
// ============================================================================

fn lowercase_extension(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default()
}

fn display_suffix(path: &Path) -> String {
    match path.extension().and_then(OsStr::to_str) {
        Some(ext) => format!(".{ext}"),
        None => String::new(),
    }
}

fn is_model_extension(extension: &str, model_extensions: &[String]) -> bool {
    !extension.is_empty()
        && model_extensions
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(extension))
}

fn read_string(map: &JsonMap, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
        _ => None,
    }
}

/// Parse a virtual link descriptor: a JSON object with a required `target`
/// (optional `label` and `link_type`) or a bare-text target path. Returns
/// `None` when the file is unreadable or names no target.
fn load_virtual_link(path: &Path) -> Option<JsonMap> {
    let raw = fs::read_to_string(path).ok()?;

    let data = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => JsonMap::new(),
        Err(_) => {
            let mut map = JsonMap::new();
            let text = raw.trim();
            if !text.is_empty() {
                map.insert("target".to_string(), json!(text));
            }
            map
        }
    };

    let target = match data.get("target") {
        Some(Value::String(value)) if !value.trim().is_empty() => value.trim().to_string(),
        _ => return None,
    };
    let target = match fs::canonicalize(&target) {
        Ok(resolved) => resolved.display().to_string(),
        Err(_) => target,
    };

    let label = match data.get("label") {
        Some(Value::String(value)) if !value.trim().is_empty() => value.trim().to_string(),
        _ => path
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or_default()
            .to_string(),
    };
    let link_type = match data.get("link_type") {
        Some(Value::String(value)) if !value.is_empty() => value.clone(),
        _ => "virtual".to_string(),
    };

    let mut entry = JsonMap::new();
    entry.insert("target".to_string(), json!(target));
    entry.insert("label".to_string(), json!(label));
    entry.insert("link_type".to_string(), json!(link_type));
    Some(entry)
}

// ============================================================================
// Link merging
// ============================================================================

const LINK_IDENTITY_KEYS: [&str; 4] = ["link_id", "path", "target_path", "label"];

/// First non-empty identity field, as a (field, value) pair so that a
/// `link_id` never collides with an unrelated `path` of the same text.
fn link_identity(entry: &JsonMap) -> Option<(String, String)> {
    for key in LINK_IDENTITY_KEYS {
        if let Some(Value::String(value)) = entry.get(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some((key.to_string(), trimmed.to_string()));
            }
        }
    }
    None
}

pub(crate) fn normalize_link_entries(value: Option<&Value>) -> Vec<JsonMap> {
    match value {
        Some(Value::Object(map)) => vec![map.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

/// Merge freshly scanned link entries with previously persisted ones. On an
/// identity collision the persisted entry wins, keeping the scan position;
/// entries without a scanned counterpart are appended in stored order.
fn merge_link_entries(scanned: Vec<JsonMap>, preserved: Vec<JsonMap>) -> Vec<JsonMap> {
    if preserved.is_empty() {
        return scanned;
    }

    let mut merged: Vec<(Option<(String, String)>, JsonMap)> = Vec::new();
    for entry in scanned.into_iter().chain(preserved) {
        let identity = link_identity(&entry);
        let slot = identity
            .as_ref()
            .and_then(|id| merged.iter_mut().find(|(key, _)| key.as_ref() == Some(id)));
        match slot {
            Some((_, kept)) => *kept = entry,
            None => merged.push((identity, entry)),
        }
    }
    merged.into_iter().map(|(_, entry)| entry).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn service() -> AssetService {
        AssetService::in_memory().unwrap()
    }

    fn container_dir(root: &Path) -> PathBuf {
        let dir = root.join(Uuid::new_v4().to_string());
        fs::create_dir(&dir).unwrap();
        dir
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    fn scan(service: &AssetService, folder: &Path) -> ScanOutcome {
        let stored = fs::canonicalize(folder).unwrap().display().to_string();
        let existing = service.get_asset_by_path(&stored).unwrap();
        scan_container_folder(service, folder, existing.as_ref(), &ScanOptions::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn container_folder_names_must_parse_as_uuids() {
        assert!(is_container_folder(Path::new(
            "/library/0f9b2c1e-8a64-4f5b-9d3c-2f6a1b7c8d90"
        )));
        assert!(!is_container_folder(Path::new("/library/boats")));
        assert!(!is_container_folder(Path::new("/")));
    }

    #[test]
    fn non_uuid_folders_are_skipped() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = dir.path().join("loose-models");
        fs::create_dir(&folder).unwrap();

        let outcome =
            scan_container_folder(&service, &folder, None, &ScanOptions::default()).unwrap();

        assert!(outcome.is_none());
        assert!(service.list_assets().unwrap().is_empty());
    }

    #[test]
    fn a_first_scan_registers_the_container_and_its_children() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");
        write_file(&folder, "notes.txt", b"print slow");

        let outcome = scan(&service, &folder);

        assert_eq!(outcome.component_count, 2);
        let metadata = &outcome.asset.metadata;
        assert_eq!(metadata.get("kind"), Some(&json!("container")));
        assert_eq!(metadata.get("container_type"), Some(&json!("container")));
        assert_eq!(metadata.get("created_from_scan"), Some(&json!(true)));
        assert_eq!(metadata.get("component_count"), Some(&json!(2)));

        let components = metadata.get("components").and_then(Value::as_array).unwrap();
        assert_eq!(components.len(), 1);
        let component = components[0].as_object().unwrap();
        assert_eq!(component.get("relative_path"), Some(&json!("part.stl")));
        assert_eq!(component.get("suffix"), Some(&json!(".stl")));
        assert_eq!(component.get("label"), Some(&json!("part.stl")));
        assert_eq!(component.get("file_size"), Some(&json!(10)));

        let files = metadata.get("files").and_then(Value::as_array).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].get("relative_path"), Some(&json!("notes.txt")));

        // Every child got its own asset row with the scan stub metadata.
        let child_path = component.get("path").and_then(Value::as_str).unwrap();
        let child = service.get_asset_by_path(child_path).unwrap().unwrap();
        assert_eq!(child.label, "part.stl");
        assert_eq!(child.metadata.get("created_from_scan"), Some(&json!(true)));
        assert_eq!(child.metadata.get("file_size"), Some(&json!(10)));
        assert_eq!(child.metadata.get("suffix"), Some(&json!(".stl")));
    }

    #[test]
    fn sidecar_previews_stay_out_of_the_attachment_list() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");
        write_file(&folder, "part.stl.png", b"png bytes");
        write_file(&folder, "part_top.png", b"png bytes");
        write_file(&folder, "logo.png", b"png bytes");

        let outcome = scan(&service, &folder);

        // Both part-derived renders are previews; the unrelated PNG is a
        // plain attachment.
        assert_eq!(outcome.component_count, 2);
        let metadata = &outcome.asset.metadata;
        let components = metadata.get("components").and_then(Value::as_array).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].get("label"), Some(&json!("part.stl")));
        let files = metadata.get("files").and_then(Value::as_array).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].get("label"), Some(&json!("logo.png")));

        // The skipped preview still has an asset row of its own.
        let preview = fs::canonicalize(folder.join("part.stl.png")).unwrap();
        assert!(service
            .get_asset_by_path(&preview.display().to_string())
            .unwrap()
            .is_some());
    }

    #[test]
    fn rescans_of_an_unchanged_folder_are_idempotent() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");
        write_file(&folder, "readme.md", b"# pack");

        scan(&service, &folder);
        let second = scan(&service, &folder);
        let third = scan(&service, &folder);

        assert_eq!(second.asset.metadata, third.asset.metadata);
        assert_eq!(second.asset.label, third.asset.label);
        assert_eq!(second.component_count, third.component_count);
    }

    #[test]
    fn stored_display_name_and_type_survive_a_plain_rescan() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");

        let options = ScanOptions {
            display_name: Some("Benchy pack".to_string()),
            container_type: Some("kit".to_string()),
            ..ScanOptions::default()
        };
        let first = scan_container_folder(&service, &folder, None, &options)
            .unwrap()
            .unwrap();
        assert_eq!(first.asset.label, "Benchy pack");

        let rescan = scan_container_folder(
            &service,
            &folder,
            Some(&first.asset),
            &ScanOptions::default(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(rescan.asset.label, "Benchy pack");
        assert_eq!(
            rescan.asset.metadata.get("display_name"),
            Some(&json!("Benchy pack"))
        );
        assert_eq!(rescan.asset.metadata.get("container_type"), Some(&json!("kit")));
        assert_eq!(
            rescan.asset.metadata.get("updated_from_scan"),
            Some(&json!(true))
        );
    }

    #[test]
    fn unknown_container_keys_survive_reconciliation() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");

        let first = scan(&service, &folder);

        let mut metadata = first.asset.metadata.clone();
        metadata.insert("color_scheme".to_string(), json!("galaxy black"));
        metadata.insert(
            "print_settings".to_string(),
            json!({"layer_height": 0.2, "supports": false}),
        );
        let updated = service
            .update_asset(first.asset.id, AssetUpdate::metadata(metadata))
            .unwrap();

        let rescan =
            scan_container_folder(&service, &folder, Some(&updated), &ScanOptions::default())
                .unwrap()
                .unwrap();

        assert_eq!(
            rescan.asset.metadata.get("color_scheme"),
            Some(&json!("galaxy black"))
        );
        assert_eq!(
            rescan.asset.metadata.get("print_settings"),
            Some(&json!({"layer_height": 0.2, "supports": false}))
        );
    }

    #[test]
    fn virtual_links_accept_json_and_bare_text_descriptors() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        let target = write_file(dir.path(), "remote.stl", b"solid remote");
        write_file(
            &folder,
            "remote.mvlink",
            format!(
                r#"{{"target": "{}", "label": "Remote part", "link_type": "reference"}}"#,
                target.display()
            )
            .as_bytes(),
        );
        write_file(&folder, "plain.mvlink", b"/somewhere/else/model.stl\n");
        write_file(&folder, "broken.mvlink", b"{\"label\": \"no target\"}");

        let outcome = scan(&service, &folder);

        // The malformed descriptor is dropped but still counted as a child.
        assert_eq!(outcome.component_count, 3);
        let links = outcome
            .asset
            .metadata
            .get("links")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(links.len(), 2);

        let json_link = links
            .iter()
            .find(|link| link.get("label") == Some(&json!("Remote part")))
            .unwrap();
        assert_eq!(json_link.get("link_type"), Some(&json!("reference")));
        assert_eq!(
            json_link.get("target").and_then(Value::as_str),
            Some(fs::canonicalize(&target).unwrap().display().to_string().as_str())
        );

        let bare_link = links
            .iter()
            .find(|link| link.get("label") == Some(&json!("plain")))
            .unwrap();
        assert_eq!(bare_link.get("link_type"), Some(&json!("virtual")));
        assert_eq!(
            bare_link.get("target"),
            Some(&json!("/somewhere/else/model.stl"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_with_a_model_suffix_classify_as_links() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");
        std::os::unix::fs::symlink(folder.join("part.stl"), folder.join("copy.stl")).unwrap();

        let outcome = scan(&service, &folder);

        assert_eq!(outcome.component_count, 2);
        let metadata = &outcome.asset.metadata;
        let components = metadata.get("components").and_then(Value::as_array).unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].get("label"), Some(&json!("part.stl")));

        let links = metadata.get("links").and_then(Value::as_array).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].get("label"), Some(&json!("copy.stl")));
        assert_eq!(links[0].get("link_type"), Some(&json!("symlink")));
        assert_eq!(
            links[0].get("target"),
            Some(&json!(folder.join("part.stl").display().to_string()))
        );
    }

    #[test]
    fn persisted_link_edits_win_over_rescanned_entries() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "remote.mvlink", b"/elsewhere/part.stl");

        let first = scan(&service, &folder);

        // Edit the persisted link and add one the scanner cannot see.
        let mut metadata = first.asset.metadata.clone();
        let links = metadata.get_mut("links").and_then(Value::as_array_mut).unwrap();
        links[0]
            .as_object_mut()
            .unwrap()
            .insert("label".to_string(), json!("Edited label"));
        links.push(json!({
            "link_id": "manual-1",
            "target_path": "/elsewhere/other.stl",
            "label": "Manual link",
        }));
        let updated = service
            .update_asset(first.asset.id, AssetUpdate::metadata(metadata))
            .unwrap();

        let rescan =
            scan_container_folder(&service, &folder, Some(&updated), &ScanOptions::default())
                .unwrap()
                .unwrap();

        let links = rescan
            .asset
            .metadata
            .get("links")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].get("label"), Some(&json!("Edited label")));
        assert_eq!(links[1].get("label"), Some(&json!("Manual link")));
    }

    #[test]
    fn linked_components_carry_across_rescans() {
        let service = service();
        let dir = tempdir().unwrap();
        let folder = container_dir(dir.path());
        write_file(&folder, "part.stl", b"solid part");

        let first = scan(&service, &folder);

        let mut metadata = first.asset.metadata.clone();
        let components = metadata
            .get_mut("components")
            .and_then(Value::as_array_mut)
            .unwrap();
        components.push(json!({
            "kind": "linked_component",
            "path": "/other/container/wheel.stl",
            "label": "Wheel (linked)",
            "metadata": {"source_container": "elsewhere"},
        }));
        let updated = service
            .update_asset(first.asset.id, AssetUpdate::metadata(metadata))
            .unwrap();

        let rescan =
            scan_container_folder(&service, &folder, Some(&updated), &ScanOptions::default())
                .unwrap()
                .unwrap();

        assert_eq!(rescan.component_count, 1);
        let components = rescan
            .asset
            .metadata
            .get("components")
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].get("label"), Some(&json!("part.stl")));
        assert_eq!(components[1].get("kind"), Some(&json!("linked_component")));
        assert_eq!(components[1].get("label"), Some(&json!("Wheel (linked)")));
    }

    #[test]
    fn library_sweeps_reconcile_only_container_folders() {
        let service = service();
        let dir = tempdir().unwrap();
        let first = container_dir(dir.path());
        write_file(&first, "part.stl", b"solid part");
        let second = container_dir(dir.path());
        write_file(&second, "plate.3mf", b"pk");
        let loose = dir.path().join("downloads");
        fs::create_dir(&loose).unwrap();
        write_file(dir.path(), "readme.txt", b"not a container");

        let outcomes = scan_library_root(&service, dir.path(), &ScanOptions::default()).unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|outcome| outcome.component_count == 1));
        assert!(service
            .get_asset_by_path(&fs::canonicalize(&loose).unwrap().display().to_string())
            .unwrap()
            .is_none());

        // A second sweep reuses the stored rows instead of recreating them.
        let again = scan_library_root(&service, dir.path(), &ScanOptions::default()).unwrap();
        assert_eq!(again.len(), 2);
    }
}
