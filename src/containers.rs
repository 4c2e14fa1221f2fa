//! Container lifecycle on top of the asset service: folder allocation,
//! reciprocal links between containers, component imports across those
//! links and the denormalized reference bookkeeping they require.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::{format_timestamp, Asset, AssetUpdate, ContainerVersion};
use crate::error::{Error, Result};
use crate::metadata::{
    apply_container_schedule, build_linked_component_entry, container_display_name,
    get_container_schedule, is_container_asset, ComponentEntry, ContainerMetadata,
    ContainerSchedule, JsonMap, CONTAINER_SCHEDULE_KEY,
};
use crate::scan::normalize_link_entries;
use crate::service::AssetService;

/// Attempts at drawing an unused UUID before giving up on folder creation.
const ALLOCATION_ATTEMPTS: usize = 100;

/// Container-level operations. Borrows the asset service; the library root
/// is where [`ContainerService::create_container`] allocates new folders
/// unless the caller overrides it per call.
pub struct ContainerService<'a> {
    assets: &'a AssetService,
    library_root: PathBuf,
}

impl<'a> ContainerService<'a> {
    pub fn new(assets: &'a AssetService, library_root: impl Into<PathBuf>) -> Self {
        Self {
            assets,
            library_root: library_root.into(),
        }
    }

    /// Create a new on-disk container folder and its asset row.
    ///
    /// The folder gets a fresh UUID name under `root` (or the configured
    /// library root). Caller-supplied metadata entries override the seeded
    /// container document.
    pub fn create_container(
        &self,
        name: &str,
        root: Option<&Path>,
        metadata: Option<&JsonMap>,
    ) -> Result<(Asset, PathBuf)> {
        let base_root = root.unwrap_or(&self.library_root);
        fs::create_dir_all(base_root).map_err(|err| Error::io(base_root, err))?;

        let mut candidate = base_root.join(Uuid::new_v4().to_string());
        let mut attempts = 0;
        while candidate.exists() {
            candidate = base_root.join(Uuid::new_v4().to_string());
            attempts += 1;
            if attempts > ALLOCATION_ATTEMPTS {
                return Err(Error::io(
                    base_root,
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "unable to allocate a unique container name",
                    ),
                ));
            }
        }
        fs::create_dir(&candidate).map_err(|err| Error::io(&candidate, err))?;

        let candidate_text = candidate.display().to_string();
        let mut seed = JsonMap::new();
        seed.insert("kind".to_string(), json!("container"));
        seed.insert("display_name".to_string(), json!(name));
        seed.insert("components".to_string(), json!([]));
        seed.insert("links".to_string(), json!([]));
        seed.insert("files".to_string(), json!([]));
        seed.insert("container_path".to_string(), json!(candidate_text));
        if let Some(extra) = metadata {
            for (key, value) in extra {
                seed.insert(key.clone(), value.clone());
            }
        }

        let asset = self
            .assets
            .create_asset(&candidate_text, Some(name), Some(&seed), None)?;
        Ok((asset, candidate))
    }

    /// Create reciprocal metadata links between two containers.
    ///
    /// The outgoing entry lands in `source.metadata.links` and the incoming
    /// one in `target.metadata.linked_from`; both share one freshly drawn
    /// `link_id`. With `target_version_id` the link references that snapshot
    /// (rejected when it belongs to another container); omitted, the
    /// target's most recent version is referenced if any exist, else the
    /// link points at the live working copy. Linking a container to itself
    /// is a no-op returning the inputs unchanged.
    pub fn link_containers(
        &self,
        source_container: &Asset,
        target_container: &Asset,
        link_type: &str,
        target_version_id: Option<i64>,
    ) -> Result<(Asset, Asset)> {
        if source_container.id == target_container.id {
            return Ok((source_container.clone(), target_container.clone()));
        }

        let link_id = Uuid::new_v4().to_string();
        let source_label = container_display_name(source_container);
        let target_label = container_display_name(target_container);

        let version = match target_version_id {
            Some(version_id) => {
                let version = self.assets.get_container_version(version_id)?;
                match version {
                    Some(version) if version.container_asset_id == target_container.id => {
                        Some(version)
                    }
                    _ => {
                        return Err(Error::validation(
                            "target version does not belong to the selected container",
                        ))
                    }
                }
            }
            None => self
                .assets
                .get_latest_container_version(target_container.id)?,
        };
        let version_payload = version.as_ref().map(version_snapshot).unwrap_or_default();

        let mut link_metadata = JsonMap::new();
        link_metadata.insert("link_id".to_string(), json!(link_id));
        link_metadata.insert("link_type".to_string(), json!(link_type));
        link_metadata.insert("link_target".to_string(), json!(target_container.path));
        link_metadata.insert("link_direction".to_string(), json!("outgoing"));
        link_metadata.insert(
            "target_container_id".to_string(),
            json!(target_container.id),
        );
        link_metadata.insert(
            "source_container_id".to_string(),
            json!(source_container.id),
        );
        for (key, value) in &version_payload {
            link_metadata.insert(key.clone(), value.clone());
        }

        let mut outgoing = JsonMap::new();
        outgoing.insert("path".to_string(), json!(target_container.path));
        outgoing.insert("target_path".to_string(), json!(target_container.path));
        outgoing.insert("label".to_string(), json!(target_label));
        outgoing.insert("kind".to_string(), json!("link"));
        outgoing.insert("link_id".to_string(), json!(link_id));
        outgoing.insert(
            "target_container_id".to_string(),
            json!(target_container.id),
        );
        outgoing.insert("metadata".to_string(), Value::Object(link_metadata));
        outgoing.insert("asset_id".to_string(), json!(target_container.id));
        for (key, value) in &version_payload {
            outgoing.insert(key.clone(), value.clone());
        }

        let mut source_metadata = source_container.metadata.clone();
        let mut links = normalize_link_entries(source_metadata.get("links"));
        links.push(outgoing);
        source_metadata.insert(
            "links".to_string(),
            Value::Array(links.into_iter().map(Value::Object).collect()),
        );

        let mut incoming = JsonMap::new();
        incoming.insert("link_id".to_string(), json!(link_id));
        incoming.insert(
            "source_container_id".to_string(),
            json!(source_container.id),
        );
        incoming.insert("source_path".to_string(), json!(source_container.path));
        incoming.insert("source_label".to_string(), json!(source_label));
        incoming.insert("link_type".to_string(), json!(link_type));
        for (key, value) in &version_payload {
            incoming.insert(key.clone(), value.clone());
        }

        let mut target_metadata = target_container.metadata.clone();
        let mut linked_from = normalize_link_entries(target_metadata.get("linked_from"));
        linked_from.push(incoming);
        target_metadata.insert(
            "linked_from".to_string(),
            Value::Array(linked_from.into_iter().map(Value::Object).collect()),
        );

        let updated_source = self
            .assets
            .update_asset(source_container.id, AssetUpdate::metadata(source_metadata))?;
        let updated_target = self
            .assets
            .update_asset(target_container.id, AssetUpdate::metadata(target_metadata))?;

        Ok((updated_source, updated_target))
    }

    /// Rewrite the cached label/path copies inside every link entry that
    /// references `container`. Link entries denormalize the display name
    /// and path of their counterpart, so a rename or move must fan out.
    pub fn refresh_link_references(&self, container: &Asset) -> Result<()> {
        let label = container_display_name(container);
        let path = container.path.as_str();

        for asset in self.assets.list_assets()? {
            let mut metadata = asset.metadata.clone();
            let mut changed = false;

            if let Some(Value::Array(links)) = metadata.get_mut("links") {
                for entry in links.iter_mut() {
                    let Some(map) = entry.as_object_mut() else {
                        continue;
                    };
                    if map.get("target_container_id").and_then(Value::as_i64) != Some(container.id)
                    {
                        continue;
                    }
                    map.insert("label".to_string(), json!(label));
                    map.insert("path".to_string(), json!(path));
                    map.insert("target_path".to_string(), json!(path));
                    let mut inner = match map.get("metadata") {
                        Some(Value::Object(inner)) => inner.clone(),
                        _ => JsonMap::new(),
                    };
                    inner.insert("link_target".to_string(), json!(path));
                    inner.insert("target_container_id".to_string(), json!(container.id));
                    map.insert("metadata".to_string(), Value::Object(inner));
                    changed = true;
                }
            }

            if let Some(Value::Array(linked_from)) = metadata.get_mut("linked_from") {
                for entry in linked_from.iter_mut() {
                    let Some(map) = entry.as_object_mut() else {
                        continue;
                    };
                    if map.get("source_container_id").and_then(Value::as_i64) != Some(container.id)
                    {
                        continue;
                    }
                    map.insert("source_label".to_string(), json!(label));
                    map.insert("source_path".to_string(), json!(path));
                    changed = true;
                }
            }

            if changed {
                self.assets
                    .update_asset(asset.id, AssetUpdate::metadata(metadata))?;
            }
        }
        Ok(())
    }

    /// Walk the asset's ancestor directories until one of them is a stored
    /// container asset.
    pub fn find_container_for_asset(&self, asset: &Asset) -> Result<Option<Asset>> {
        let mut current = match Path::new(&asset.path).parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(None),
        };
        loop {
            let Some(next) = current.parent() else {
                return Ok(None);
            };
            if !current.exists() {
                return Ok(None);
            }
            if let Some(candidate) = self
                .assets
                .get_asset_by_path(&current.display().to_string())?
            {
                if is_container_asset(&candidate) {
                    return Ok(Some(candidate));
                }
            }
            current = next.to_path_buf();
        }
    }

    /// Import a component from another container as a `linked_component`
    /// entry on `container`.
    ///
    /// `component_path` names an entry in `source_container`'s document.
    /// The imported entry carries fresh `link_import` provenance pointing
    /// back at the source; importing the same source component a second
    /// time is rejected. The append mutates the raw document, so keys this
    /// crate does not model stay untouched, and `component_count` remains
    /// the scanner's to maintain.
    pub fn link_component(
        &self,
        container: &Asset,
        source_container: &Asset,
        component_path: &str,
        override_label: Option<&str>,
    ) -> Result<(Asset, ComponentEntry)> {
        let wanted = component_path.trim();
        if wanted.is_empty() {
            return Err(Error::validation("component path must not be empty"));
        }

        let source_doc = ContainerMetadata::from_map(&source_container.metadata);
        let component = source_doc
            .components
            .iter()
            .find(|entry| entry.path.as_deref().map(str::trim) == Some(wanted))
            .ok_or_else(|| {
                Error::not_found(format!(
                    "component {wanted} in container {}",
                    source_container.path
                ))
            })?;
        let entry = build_linked_component_entry(component, source_container, override_label)?;

        let target_doc = ContainerMetadata::from_map(&container.metadata);
        let already_linked = target_doc.linked_components().any(|existing| {
            existing.link_import().is_some_and(|provenance| {
                provenance.source_container_id == source_container.id
                    && provenance.source_component_path == wanted
            })
        });
        if already_linked {
            return Err(Error::validation(
                "component is already linked into this container",
            ));
        }

        let mut metadata = container.metadata.clone();
        let mut components = metadata
            .get("components")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        components.push(serde_json::to_value(&entry)?);
        metadata.insert("components".to_string(), Value::Array(components));

        let updated = self
            .assets
            .update_asset(container.id, AssetUpdate::metadata(metadata))?;
        tracing::debug!(
            container = %updated.path,
            source = %source_container.path,
            component = %wanted,
            "linked component"
        );
        Ok((updated, entry))
    }

    /// Persist `schedule` as the container's scheduling block, replacing
    /// any previous block and leaving the rest of the document alone.
    pub fn update_schedule(
        &self,
        container: &Asset,
        schedule: &ContainerSchedule,
    ) -> Result<Asset> {
        let metadata = apply_container_schedule(&container.metadata, schedule);
        self.assets
            .update_asset(container.id, AssetUpdate::metadata(metadata))
    }

    /// Rewrite every container's scheduling block in canonical form.
    ///
    /// Containers without the block get one seeded with defaults, and
    /// documents carrying legacy top-level scheduling fields have them
    /// lifted under the `container_metadata` key. Documents already in
    /// canonical form are left alone. Returns how many containers were
    /// rewritten.
    pub fn normalize_schedules(&self) -> Result<usize> {
        let mut updated = 0;
        for asset in self.assets.list_assets()? {
            if !is_container_asset(&asset) {
                continue;
            }
            let schedule = get_container_schedule(&asset.metadata);
            let desired = schedule.to_map();
            let current = asset
                .metadata
                .get(CONTAINER_SCHEDULE_KEY)
                .and_then(Value::as_object);
            if current == Some(&desired) {
                continue;
            }
            let metadata = apply_container_schedule(&asset.metadata, &schedule);
            self.assets
                .update_asset(asset.id, AssetUpdate::metadata(metadata))?;
            tracing::debug!(path = %asset.path, "normalized container schedule");
            updated += 1;
        }
        Ok(updated)
    }
}

fn version_snapshot(version: &ContainerVersion) -> JsonMap {
    let mut payload = JsonMap::new();
    payload.insert("target_version_id".to_string(), json!(version.id));
    payload.insert("target_version_name".to_string(), json!(version.name));
    payload.insert(
        "target_version_created_at".to_string(),
        json!(format_timestamp(version.created_at)),
    );
    payload
}
