//! High level asset operations.
//!
//! [`AssetService`] fronts the repository with path-oriented tag helpers,
//! the tag co-occurrence graph, orphan pruning, container versioning, the
//! customization pipeline and preview-cache orchestration. Both preview
//! caches are optional; without one the corresponding `ensure_*` call is a
//! logged no-op, never an error.

pub mod lineage;
pub mod tag_graph;

pub use lineage::{
    run_customization, ArtifactOutcome, BuildSession, CustomizationOutcome, CustomizerBackend,
    GeneratedArtifact, ParameterDescriptor, ParameterSchema,
};
pub use tag_graph::{build_tag_graph, TagGraph, TagGraphLink, TagGraphNode};

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::cache::{CacheOutcome, ContentCache, RenderParams};
use crate::db::{
    Asset, AssetRelationship, AssetRepository, AssetUpdate, ContainerVersion, Customization,
};
use crate::error::{Error, Result};
use crate::gcode::extract_render_hints;
use crate::metadata::JsonMap;

/// Raster sizes used when the caller does not pass one.
pub const DEFAULT_THUMBNAIL_SIZE: (u32, u32) = (512, 512);
pub const DEFAULT_GCODE_PREVIEW_SIZE: (u32, u32) = (768, 512);

/// Starter assets written by [`AssetService::bootstrap_demo_data`], as
/// `(path, label, description, tags)`.
const DEMO_SEEDS: &[(&str, &str, &str, &[&str])] = &[
    (
        "docs/getting-started.md",
        "Getting started guide",
        "How to lay out a print library with modelvault.",
        &["docs", "overview"],
    ),
    (
        "models/calibration/xyz-cube.stl",
        "XYZ calibration cube",
        "20mm cube for dialing in new filament.",
        &["calibration", "test-print"],
    ),
    (
        "models/boats/benchy.stl",
        "Benchy",
        "The classic print tuning torture test.",
        &["boat", "test-print"],
    ),
    (
        "profiles/petg-standard.ini",
        "PETG standard profile",
        "Slicer profile for 0.2mm PETG parts.",
        &["profile", "petg"],
    ),
    (
        "notes/print-queue.txt",
        "Print queue notes",
        "Scratch pad for prints to schedule next.",
        &["notes", "planning"],
    ),
];

pub struct AssetService {
    repository: AssetRepository,
    thumbnails: Option<ContentCache>,
    gcode_previews: Option<ContentCache>,
}

impl AssetService {
    pub fn new(repository: AssetRepository) -> Self {
        Self {
            repository,
            thumbnails: None,
            gcode_previews: None,
        }
    }

    /// Service over a fresh private in-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(AssetRepository::in_memory()?))
    }

    pub fn with_thumbnail_cache(mut self, cache: ContentCache) -> Self {
        self.thumbnails = Some(cache);
        self
    }

    pub fn with_gcode_preview_cache(mut self, cache: ContentCache) -> Self {
        self.gcode_previews = Some(cache);
        self
    }

    pub fn repository(&self) -> &AssetRepository {
        &self.repository
    }

    // ========================================================================
    // Asset CRUD passthroughs
    // ========================================================================

    pub fn list_assets(&self) -> Result<Vec<Asset>> {
        self.repository.list_assets()
    }

    pub fn get_asset(&self, asset_id: i64) -> Result<Option<Asset>> {
        self.repository.get_asset(asset_id)
    }

    pub fn get_asset_by_path(&self, path: &str) -> Result<Option<Asset>> {
        self.repository.get_asset_by_path(path)
    }

    pub fn create_asset(
        &self,
        path: &str,
        label: Option<&str>,
        metadata: Option<&JsonMap>,
        tags: Option<&[String]>,
    ) -> Result<Asset> {
        self.repository.create_asset(path, label, metadata, tags)
    }

    pub fn ensure_asset(
        &self,
        path: &str,
        label: Option<&str>,
        metadata: Option<&JsonMap>,
    ) -> Result<Asset> {
        self.repository.ensure_asset(path, label, metadata)
    }

    pub fn update_asset(&self, asset_id: i64, update: AssetUpdate) -> Result<Asset> {
        self.repository.update_asset(asset_id, update)
    }

    pub fn delete_asset(&self, asset_id: i64) -> Result<bool> {
        self.repository.delete_asset(asset_id)
    }

    pub fn delete_asset_by_path(&self, path: &str) -> Result<bool> {
        self.repository.delete_asset_by_path(path)
    }

    // ========================================================================
    // Tag operations
    // ========================================================================

    pub fn tags_for_path(&self, path: &str) -> Result<Vec<String>> {
        self.repository.tags_for_path(path)
    }

    /// Replace the tag list for `path`, creating the asset row on demand.
    pub fn set_tags(&self, path: &str, tags: &[String]) -> Result<Vec<String>> {
        let asset = self.ensure_asset(path, Some(path), None)?;
        self.repository.set_tags(asset.id, tags)
    }

    /// Assign one tag to `path`, creating the asset row on demand.
    pub fn add_tag(&self, path: &str, tag: &str) -> Result<Option<String>> {
        let asset = self.ensure_asset(path, Some(path), None)?;
        self.repository.add_tag(asset.id, tag)
    }

    /// Remove one tag from `path`. Unknown paths report `false` instead of
    /// creating a row.
    pub fn remove_tag(&self, path: &str, tag: &str) -> Result<bool> {
        let Some(asset) = self.get_asset_by_path(path)? else {
            return Ok(false);
        };
        self.repository.remove_tag(asset.id, tag)
    }

    pub fn rename_tag(&self, path: &str, old_tag: &str, new_tag: &str) -> Result<Option<String>> {
        let Some(asset) = self.get_asset_by_path(path)? else {
            return Ok(None);
        };
        self.repository.rename_tag(asset.id, old_tag, new_tag)
    }

    pub fn search_tags(&self, query: &str) -> Result<BTreeMap<String, Vec<String>>> {
        self.repository.search_tags(query)
    }

    pub fn all_tags(&self) -> Result<Vec<String>> {
        self.repository.all_tags()
    }

    pub fn iter_tagged_assets(&self) -> Result<Vec<(String, Vec<String>)>> {
        self.repository.iter_tagged_assets()
    }

    /// Co-occurrence graph over every tagged asset. See
    /// [`tag_graph::build_tag_graph`] for ordering and filtering rules.
    pub fn build_tag_graph(
        &self,
        min_cooccurrence: usize,
        max_tags: Option<usize>,
    ) -> Result<TagGraph> {
        let entries = self.repository.iter_tagged_assets()?;
        Ok(build_tag_graph(&entries, min_cooccurrence, max_tags))
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Delete assets whose backing file no longer exists and return them.
    ///
    /// Relative paths resolve against `base_path` and must stay within it;
    /// candidates that cannot be resolved, or would escape the base, are
    /// skipped rather than deleted. Absolute paths are checked directly.
    pub fn prune_missing_assets(&self, base_path: Option<&Path>) -> Result<Vec<Asset>> {
        let base = base_path.map(normalize_lexically);
        let mut removed = Vec::new();

        for asset in self.repository.list_assets()? {
            let candidate = Path::new(&asset.path);
            let resolved = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                let Some(base) = base.as_deref() else {
                    continue;
                };
                let joined = normalize_lexically(&base.join(candidate));
                if !joined.starts_with(base) {
                    tracing::warn!(
                        path = %asset.path,
                        "not pruning a path that resolves outside the library"
                    );
                    continue;
                }
                joined
            };

            if resolved.exists() {
                continue;
            }
            if self.repository.delete_asset(asset.id)? {
                tracing::debug!(path = %asset.path, "pruned asset with no backing file");
                removed.push(asset);
            }
        }

        Ok(removed)
    }

    // ========================================================================
    // Container versions
    // ========================================================================

    /// Snapshot the container's metadata under `name`. `metadata = None`
    /// captures the current document.
    pub fn create_container_version(
        &self,
        container_asset_id: i64,
        name: &str,
        metadata: Option<&JsonMap>,
        notes: Option<&str>,
        source_version_id: Option<i64>,
    ) -> Result<ContainerVersion> {
        self.repository.create_container_version(
            container_asset_id,
            name,
            metadata,
            notes,
            source_version_id,
        )
    }

    pub fn get_container_version(&self, version_id: i64) -> Result<Option<ContainerVersion>> {
        self.repository.get_container_version(version_id)
    }

    pub fn list_container_versions(
        &self,
        container_asset_id: i64,
    ) -> Result<Vec<ContainerVersion>> {
        self.repository.list_container_versions(container_asset_id)
    }

    pub fn get_latest_container_version(
        &self,
        container_asset_id: i64,
    ) -> Result<Option<ContainerVersion>> {
        self.repository.get_latest_container_version(container_asset_id)
    }

    pub fn rename_container_version(
        &self,
        version_id: i64,
        new_name: &str,
    ) -> Result<ContainerVersion> {
        self.repository.rename_container_version(version_id, new_name)
    }

    pub fn delete_container_version(&self, version_id: i64) -> Result<bool> {
        self.repository.delete_container_version(version_id)
    }

    // ========================================================================
    // Customization lineage
    // ========================================================================

    /// Bind a schema/value set to the asset stored at `base_path`.
    pub fn create_customization(
        &self,
        base_path: &str,
        backend_identifier: &str,
        parameter_schema: Option<&JsonMap>,
        parameter_values: Option<&JsonMap>,
    ) -> Result<Customization> {
        let base = self
            .get_asset_by_path(base_path)?
            .ok_or_else(|| Error::not_found(format!("no asset stored for path {base_path}")))?;
        self.repository.create_customization(
            base.id,
            backend_identifier,
            parameter_schema,
            parameter_values,
        )
    }

    pub fn list_customizations_for_asset(&self, base_asset_id: i64) -> Result<Vec<Customization>> {
        self.repository.list_customizations_for_asset(base_asset_id)
    }

    /// Ensure an asset exists at `path` and link it to `customization_id`.
    /// Re-recording the same derivative refreshes the edge instead of
    /// duplicating it.
    pub fn record_derivative(
        &self,
        customization_id: i64,
        path: &str,
        relationship_type: &str,
        label: Option<&str>,
        metadata: Option<&JsonMap>,
    ) -> Result<(Asset, AssetRelationship)> {
        let customization = self
            .repository
            .get_customization(customization_id)?
            .ok_or_else(|| {
                Error::not_found(format!("customization {customization_id} does not exist"))
            })?;

        let asset = self.repository.ensure_asset(path, label, metadata)?;
        let relationship = self.repository.create_asset_relationship(
            customization.id,
            asset.id,
            relationship_type,
        )?;
        Ok((asset, relationship))
    }

    pub fn list_derivatives_for_asset(
        &self,
        base_asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Vec<Asset>> {
        self.repository
            .list_derivatives_for_asset(base_asset_id, relationship_type)
    }

    pub fn get_base_for_derivative(
        &self,
        derivative_asset_id: i64,
        relationship_type: Option<&str>,
    ) -> Result<Option<Asset>> {
        self.repository
            .get_base_for_derivative(derivative_asset_id, relationship_type)
    }

    /// Execute a customizer backend against `base_asset` and persist every
    /// artifact it produces. See [`lineage::run_customization`].
    pub fn run_customization(
        &self,
        base_asset: &Asset,
        backend: &dyn CustomizerBackend,
        parameters: &JsonMap,
        storage_root: &Path,
    ) -> Result<CustomizationOutcome> {
        lineage::run_customization(self, base_asset, backend, parameters, storage_root)
    }

    // ========================================================================
    // Preview caches
    // ========================================================================

    /// Ensure `asset` has a cached thumbnail, writing the descriptor into
    /// `metadata.thumbnail` when it changed.
    ///
    /// A descriptor whose `source` is `viewer_capture` pins a hand-picked
    /// image: as long as its recorded file is readable it is served as-is
    /// and the renderer never runs. Render failures and a missing cache
    /// degrade to `Ok(None)`.
    pub fn ensure_thumbnail(
        &self,
        asset: &Asset,
        size: Option<(u32, u32)>,
    ) -> Result<(Asset, Option<CacheOutcome>)> {
        if let Some(outcome) = viewer_capture_outcome(asset) {
            return Ok((asset.clone(), Some(outcome)));
        }
        self.ensure_preview(
            asset,
            self.thumbnails.as_ref(),
            "thumbnail",
            &RenderParams::new(),
            size.unwrap_or(DEFAULT_THUMBNAIL_SIZE),
        )
    }

    /// Ensure `asset` has a cached toolpath preview under
    /// `metadata.gcode_preview`. Render hints come from the asset's
    /// `gcodehint:` tags.
    pub fn ensure_gcode_preview(
        &self,
        asset: &Asset,
        size: Option<(u32, u32)>,
    ) -> Result<(Asset, Option<CacheOutcome>)> {
        let params = extract_render_hints(&asset.tags);
        self.ensure_preview(
            asset,
            self.gcode_previews.as_ref(),
            "gcode_preview",
            &params,
            size.unwrap_or(DEFAULT_GCODE_PREVIEW_SIZE),
        )
    }

    fn ensure_preview(
        &self,
        asset: &Asset,
        cache: Option<&ContentCache>,
        key: &str,
        params: &RenderParams,
        size: (u32, u32),
    ) -> Result<(Asset, Option<CacheOutcome>)> {
        let Some(cache) = cache else {
            tracing::debug!(path = %asset.path, "no {key} cache configured");
            return Ok((asset.clone(), None));
        };
        let Some(source) = resolve_source_path(asset) else {
            tracing::debug!(path = %asset.path, "no readable source to render a {key} from");
            return Ok((asset.clone(), None));
        };

        let existing = asset.metadata.get(key).and_then(Value::as_object);
        let outcome = match cache.get_or_render(&source, params, size, existing) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::debug!(path = %asset.path, "unable to generate {key}: {err}");
                return Ok((asset.clone(), None));
            }
        };

        // Diff before writing so an unchanged descriptor does not churn
        // updated_at.
        let fresh = Value::Object(outcome.info.clone());
        if asset.metadata.get(key) != Some(&fresh) {
            let mut metadata = asset.metadata.clone();
            metadata.insert(key.to_string(), fresh);
            let updated = self.update_asset(asset.id, AssetUpdate::metadata(metadata))?;
            return Ok((updated, Some(outcome)));
        }
        Ok((asset.clone(), Some(outcome)))
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Seed a small starter library, but only into an empty repository.
    /// Returns the full asset list either way.
    pub fn bootstrap_demo_data(&self) -> Result<Vec<Asset>> {
        let existing = self.list_assets()?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        for (path, label, description, tags) in DEMO_SEEDS {
            let mut metadata = JsonMap::new();
            metadata.insert(
                "description".to_string(),
                serde_json::json!(description),
            );
            let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
            self.create_asset(path, Some(label), Some(&metadata), Some(&tags))?;
        }
        self.list_assets()
    }
}

/// First existing candidate among the asset's `managed_path`,
/// `original_path` and its own path.
pub(crate) fn resolve_source_path(asset: &Asset) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for key in ["managed_path", "original_path"] {
        if let Some(text) = asset.metadata.get(key).and_then(Value::as_str) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                candidates.push(PathBuf::from(trimmed));
            }
        }
    }
    candidates.push(PathBuf::from(&asset.path));
    candidates.into_iter().find(|candidate| candidate.exists())
}

fn viewer_capture_outcome(asset: &Asset) -> Option<CacheOutcome> {
    let info = asset.metadata.get("thumbnail").and_then(Value::as_object)?;
    if info.get("source").and_then(Value::as_str) != Some("viewer_capture") {
        return None;
    }
    let path = PathBuf::from(info.get("path").and_then(Value::as_str)?.trim());
    if path.as_os_str().is_empty() {
        return None;
    }
    // An unreadable capture falls back to the normal render path.
    let bytes = std::fs::read(&path).ok()?;
    Some(CacheOutcome {
        path,
        info: info.clone(),
        bytes,
        updated: false,
    })
}

/// Collapse `.` and `..` components without touching the filesystem. A
/// leading `..` that cannot be popped is kept, which makes the escape check
/// in [`AssetService::prune_missing_assets`] fail closed.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RenderError, RenderOutput, Renderer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingRenderer {
        calls: Arc<AtomicUsize>,
    }

    impl Renderer for CountingRenderer {
        fn render(
            &self,
            _source: &Path,
            _params: &RenderParams,
            _size: (u32, u32),
        ) -> std::result::Result<RenderOutput, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RenderOutput {
                bytes: b"png".to_vec(),
                analysis: None,
            })
        }
    }

    struct FailingRenderer;

    impl Renderer for FailingRenderer {
        fn render(
            &self,
            _source: &Path,
            _params: &RenderParams,
            _size: (u32, u32),
        ) -> std::result::Result<RenderOutput, RenderError> {
            Err(RenderError::Failed("scripted failure".to_string()))
        }
    }

    fn service_with_thumbnails(
        cache_root: &Path,
    ) -> (AssetService, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let renderer = CountingRenderer {
            calls: Arc::clone(&calls),
        };
        let service = AssetService::in_memory()
            .unwrap()
            .with_thumbnail_cache(ContentCache::new(cache_root, Box::new(renderer)));
        (service, calls)
    }

    #[test]
    fn tag_helpers_create_the_asset_row_on_demand() {
        let service = AssetService::in_memory().unwrap();

        let tags = service
            .set_tags("models/rover.stl", &["wip".to_string()])
            .unwrap();
        assert_eq!(tags, vec!["wip"]);
        let asset = service.get_asset_by_path("models/rover.stl").unwrap().unwrap();
        assert_eq!(asset.label, "models/rover.stl");

        service.add_tag("models/lander.stl", "queued").unwrap();
        assert!(service.get_asset_by_path("models/lander.stl").unwrap().is_some());

        // Removal and rename never create rows.
        assert!(!service.remove_tag("models/ghost.stl", "wip").unwrap());
        assert!(service
            .rename_tag("models/ghost.stl", "wip", "done")
            .unwrap()
            .is_none());
        assert!(service.get_asset_by_path("models/ghost.stl").unwrap().is_none());
    }

    #[test]
    fn tag_graph_reads_repository_state() {
        let service = AssetService::in_memory().unwrap();
        service
            .set_tags("a.stl", &["bracket".to_string(), "printed".to_string()])
            .unwrap();
        service
            .set_tags("b.stl", &["bracket".to_string(), "printed".to_string()])
            .unwrap();

        let graph = service.build_tag_graph(1, None).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.links.len(), 1);
        assert_eq!(graph.links[0].weight, 2);
    }

    #[test]
    fn prune_removes_only_dead_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.stl");
        std::fs::write(&live, "solid").unwrap();

        let service = AssetService::in_memory().unwrap();
        service
            .create_asset(&live.to_string_lossy(), None, None, None)
            .unwrap();
        let dead = dir.path().join("dead.stl");
        service
            .create_asset(&dead.to_string_lossy(), None, None, None)
            .unwrap();

        let removed = service.prune_missing_assets(None).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].path, dead.to_string_lossy());
        assert_eq!(service.list_assets().unwrap().len(), 1);
    }

    #[test]
    fn prune_resolves_relative_paths_against_the_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kept.stl"), "solid").unwrap();

        let service = AssetService::in_memory().unwrap();
        service.create_asset("kept.stl", None, None, None).unwrap();
        service.create_asset("gone.stl", None, None, None).unwrap();
        service
            .create_asset("../outside.stl", None, None, None)
            .unwrap();

        // Without a base nothing relative is touched.
        assert!(service.prune_missing_assets(None).unwrap().is_empty());

        let removed = service.prune_missing_assets(Some(dir.path())).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].path, "gone.stl");

        // The escapee survives even though its resolved path is missing.
        let remaining: Vec<String> = service
            .list_assets()
            .unwrap()
            .into_iter()
            .map(|a| a.path)
            .collect();
        assert!(remaining.contains(&"../outside.stl".to_string()));
        assert!(remaining.contains(&"kept.stl".to_string()));
    }

    #[test]
    fn version_snapshot_defaults_to_current_metadata() {
        let service = AssetService::in_memory().unwrap();
        let mut metadata = JsonMap::new();
        metadata.insert("kind".to_string(), serde_json::json!("container"));
        let container = service
            .create_asset("/library/box", Some("Box"), Some(&metadata), None)
            .unwrap();

        let version = service
            .create_container_version(container.id, "v1", None, Some("first"), None)
            .unwrap();
        assert_eq!(version.metadata, container.metadata);
        assert_eq!(version.notes.as_deref(), Some("first"));

        let mut supplied = JsonMap::new();
        supplied.insert("frozen".to_string(), serde_json::json!(true));
        let explicit = service
            .create_container_version(container.id, "v2", Some(&supplied), None, None)
            .unwrap();
        assert_eq!(explicit.metadata, supplied);

        let latest = service
            .get_latest_container_version(container.id)
            .unwrap()
            .unwrap();
        assert_eq!(latest.name, "v2");
    }

    #[test]
    fn record_derivative_links_an_ensured_asset() {
        let service = AssetService::in_memory().unwrap();
        let base = service
            .create_asset("/library/base.scad", Some("Base"), None, None)
            .unwrap();
        let customization = service
            .create_customization("/library/base.scad", "openscad", None, None)
            .unwrap();
        assert_eq!(customization.base_asset_id, base.id);

        let (asset, relationship) = service
            .record_derivative(
                customization.id,
                "/library/out/custom.stl",
                "output",
                Some("Custom"),
                None,
            )
            .unwrap();
        assert_eq!(asset.label, "Custom");
        assert_eq!(relationship.base_asset_id, base.id);
        assert_eq!(relationship.derivative_asset_id, asset.id);

        let derivatives = service.list_derivatives_for_asset(base.id, None).unwrap();
        assert_eq!(derivatives.len(), 1);
        let back = service
            .get_base_for_derivative(asset.id, Some("output"))
            .unwrap()
            .unwrap();
        assert_eq!(back.id, base.id);

        let err = service
            .record_derivative(9999, "/library/out/other.stl", "output", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn create_customization_requires_the_base_path() {
        let service = AssetService::in_memory().unwrap();
        let err = service
            .create_customization("/library/missing.scad", "openscad", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn ensure_thumbnail_writes_the_descriptor_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("part.stl");
        std::fs::write(&source, "solid part").unwrap();

        let (service, calls) = service_with_thumbnails(&dir.path().join("thumbs"));
        let asset = service
            .create_asset(&source.to_string_lossy(), None, None, None)
            .unwrap();

        let (updated, outcome) = service.ensure_thumbnail(&asset, None).unwrap();
        let outcome = outcome.unwrap();
        assert!(outcome.updated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(updated.metadata.get("thumbnail").is_some());

        // Second pass matches the stored descriptor: no render, no write.
        let (same, outcome) = service.ensure_thumbnail(&updated, None).unwrap();
        let outcome = outcome.unwrap();
        assert!(!outcome.updated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(same.updated_at, updated.updated_at);
    }

    #[test]
    fn ensure_thumbnail_without_a_cache_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("part.stl");
        std::fs::write(&source, "solid part").unwrap();

        let service = AssetService::in_memory().unwrap();
        let asset = service
            .create_asset(&source.to_string_lossy(), None, None, None)
            .unwrap();

        let (unchanged, outcome) = service.ensure_thumbnail(&asset, None).unwrap();
        assert!(outcome.is_none());
        assert_eq!(unchanged, asset);
    }

    #[test]
    fn render_failures_degrade_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("part.stl");
        std::fs::write(&source, "solid part").unwrap();

        let service = AssetService::in_memory().unwrap().with_thumbnail_cache(
            ContentCache::new(dir.path().join("thumbs"), Box::new(FailingRenderer)),
        );
        let asset = service
            .create_asset(&source.to_string_lossy(), None, None, None)
            .unwrap();

        let (unchanged, outcome) = service.ensure_thumbnail(&asset, None).unwrap();
        assert!(outcome.is_none());
        assert!(unchanged.metadata.get("thumbnail").is_none());
    }

    #[test]
    fn missing_render_source_degrades_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let (service, calls) = service_with_thumbnails(&dir.path().join("thumbs"));
        let asset = service
            .create_asset("/nowhere/part.stl", None, None, None)
            .unwrap();

        let (_, outcome) = service.ensure_thumbnail(&asset, None).unwrap();
        assert!(outcome.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn render_source_prefers_the_managed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let managed = dir.path().join("managed.stl");
        std::fs::write(&managed, "solid managed").unwrap();

        let mut metadata = JsonMap::new();
        metadata.insert(
            "managed_path".to_string(),
            serde_json::json!(managed.to_string_lossy()),
        );
        let asset = Asset {
            id: 1,
            path: "/nowhere/original.stl".to_string(),
            label: "original".to_string(),
            metadata,
            tags: Vec::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        assert_eq!(resolve_source_path(&asset), Some(managed));
    }

    #[test]
    fn viewer_capture_thumbnails_bypass_the_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("part.stl");
        std::fs::write(&source, "solid part").unwrap();
        let capture = dir.path().join("capture.png");
        std::fs::write(&capture, b"captured").unwrap();

        let (service, calls) = service_with_thumbnails(&dir.path().join("thumbs"));
        let mut metadata = JsonMap::new();
        metadata.insert(
            "thumbnail".to_string(),
            serde_json::json!({
                "source": "viewer_capture",
                "path": capture.to_string_lossy(),
            }),
        );
        let asset = service
            .create_asset(&source.to_string_lossy(), None, Some(&metadata), None)
            .unwrap();

        let (unchanged, outcome) = service.ensure_thumbnail(&asset, None).unwrap();
        let outcome = outcome.unwrap();
        assert!(!outcome.updated);
        assert_eq!(outcome.bytes, b"captured");
        assert_eq!(outcome.path, capture);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(unchanged, asset);

        // A capture whose file vanished falls back to the renderer.
        std::fs::remove_file(&capture).unwrap();
        let (_, outcome) = service.ensure_thumbnail(&asset, None).unwrap();
        assert!(outcome.unwrap().updated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gcode_previews_pick_up_hint_tags() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("part.gcode");
        std::fs::write(&source, "G0 X1 Y1").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let service = AssetService::in_memory().unwrap().with_gcode_preview_cache(
            ContentCache::new(
                dir.path().join("previews"),
                Box::new(CountingRenderer {
                    calls: Arc::clone(&calls),
                }),
            ),
        );
        let asset = service
            .create_asset(
                &source.to_string_lossy(),
                None,
                None,
                Some(&["gcodehint:show_travel".to_string()]),
            )
            .unwrap();

        let (updated, outcome) = service.ensure_gcode_preview(&asset, None).unwrap();
        let outcome = outcome.unwrap();
        assert!(outcome.updated);
        let hints = outcome
            .info
            .get("hints")
            .and_then(Value::as_object)
            .unwrap();
        assert_eq!(hints.get("show_travel"), Some(&serde_json::json!("true")));
        assert!(updated.metadata.get("gcode_preview").is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bootstrap_seeds_only_an_empty_repository() {
        let service = AssetService::in_memory().unwrap();

        let seeded = service.bootstrap_demo_data().unwrap();
        assert_eq!(seeded.len(), DEMO_SEEDS.len());
        assert!(seeded.iter().any(|a| a.label == "Benchy"));

        // Idempotent on a populated repository.
        let again = service.bootstrap_demo_data().unwrap();
        assert_eq!(again.len(), seeded.len());

        let fresh = AssetService::in_memory().unwrap();
        fresh.create_asset("/library/mine.stl", None, None, None).unwrap();
        let existing = fresh.bootstrap_demo_data().unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].path, "/library/mine.stl");
    }

    #[test]
    fn lexical_normalization_collapses_dots() {
        assert_eq!(
            normalize_lexically(Path::new("/lib/./a/../b.stl")),
            PathBuf::from("/lib/b.stl")
        );
        assert_eq!(
            normalize_lexically(Path::new("a/b/../../c.stl")),
            PathBuf::from("c.stl")
        );
        // An escape that cannot be collapsed is preserved.
        assert_eq!(
            normalize_lexically(Path::new("../c.stl")),
            PathBuf::from("../c.stl")
        );
    }
}
