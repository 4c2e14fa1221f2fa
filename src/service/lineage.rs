//! Customization lineage: run a backend build against a base asset and
//! persist every produced artifact as a managed, linked derivative.
//!
//! The flow mirrors an import. The backend plans and executes in a scratch
//! directory under `<root>/.customizer_work`, each artifact is copied into
//! `<root>/customizations/<base_id>/<customization_id>/`, registered as an
//! asset and linked back to the customization record, and the scratch
//! directory is removed at the end whether the run succeeded or not.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::{Asset, AssetRelationship, AssetUpdate, Customization};
use crate::error::{Error, Result};
use crate::import::allocate_destination;
use crate::metadata::{build_asset_metadata, JsonMap};

use super::{resolve_source_path, AssetService};

/// One configurable value exposed by a customizer backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Value>,
}

/// The parameters a backend discovered on one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(default, skip_serializing_if = "JsonMap::is_empty")]
    pub metadata: JsonMap,
}

impl ParameterSchema {
    /// Serialized form stored on the customization record.
    pub fn to_map(&self) -> Result<JsonMap> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(JsonMap::new()),
        }
    }

    pub fn from_map(map: &JsonMap) -> ParameterSchema {
        serde_json::from_value(Value::Object(map.clone())).unwrap_or_default()
    }
}

/// One file (or already-registered asset) produced by a build session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    /// Where the backend wrote the file, usually inside the work directory.
    /// Ignored when `asset_id` points at an existing asset.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_relationship")]
    pub relationship: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Default for GeneratedArtifact {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            label: None,
            relationship: default_relationship(),
            asset_id: None,
            content_type: None,
        }
    }
}

impl GeneratedArtifact {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

fn default_relationship() -> String {
    "output".to_string()
}

/// Everything a backend reports back from one planned or executed build.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildSession {
    pub schema: ParameterSchema,
    /// Normalized parameter values the build actually used.
    pub parameters: JsonMap,
    pub command: Vec<String>,
    pub artifacts: Vec<GeneratedArtifact>,
    pub metadata: JsonMap,
}

/// A parameterized build engine (an OpenSCAD-style customizer, a slicer
/// profile applicator) driven by [`run_customization`].
pub trait CustomizerBackend: Send + Sync {
    /// Stable identifier recorded on customization rows.
    fn name(&self) -> &str;

    /// Inspect `source` and describe its configurable parameters.
    fn load_schema(&self, source: &Path) -> Result<ParameterSchema>;

    /// Check `values` against `schema`, returning the normalized set.
    fn validate(&self, schema: &ParameterSchema, values: &JsonMap) -> Result<JsonMap>;

    /// Plan the build and, when `execute` is set, run it with artifacts
    /// written under `output_dir`.
    fn plan_build(
        &self,
        source: &Path,
        schema: &ParameterSchema,
        values: &JsonMap,
        output_dir: &Path,
        execute: bool,
    ) -> Result<BuildSession>;
}

/// The persisted outcome for a single artifact.
#[derive(Debug, Clone)]
pub struct ArtifactOutcome {
    pub artifact: GeneratedArtifact,
    pub asset: Asset,
    pub relationship: AssetRelationship,
}

/// Aggregate result of [`run_customization`].
#[derive(Debug, Clone)]
pub struct CustomizationOutcome {
    pub base_asset: Asset,
    pub customization: Customization,
    pub artifacts: Vec<ArtifactOutcome>,
    /// Scratch directory the backend ran in. Removed before this is
    /// returned; retained here for diagnostics.
    pub work_dir: PathBuf,
}

/// Execute `backend` against `base_asset` and persist the results.
///
/// The customization record is created before the artifact pass, so a
/// failing artifact leaves the record behind with whatever artifacts were
/// already registered. The work directory is always removed.
pub fn run_customization(
    service: &AssetService,
    base_asset: &Asset,
    backend: &dyn CustomizerBackend,
    parameters: &JsonMap,
    storage_root: &Path,
) -> Result<CustomizationOutcome> {
    let base_path = resolve_source_path(base_asset).ok_or_else(|| {
        Error::not_found(format!(
            "no readable source file for asset {}",
            base_asset.path
        ))
    })?;
    let backend_identifier = backend.name().to_string();

    let work_parent = storage_root.join(".customizer_work");
    fs::create_dir_all(&work_parent).map_err(|e| Error::io(&work_parent, e))?;
    let work_dir = allocate_destination(
        &work_parent,
        &work_directory_name(base_asset, &backend_identifier),
    );
    fs::create_dir(&work_dir).map_err(|e| Error::io(&work_dir, e))?;

    tracing::debug!(
        backend = %backend_identifier,
        base = %base_asset.path,
        work_dir = %work_dir.display(),
        "running customization"
    );

    let outcome = execute_plan(
        service,
        base_asset,
        backend,
        &backend_identifier,
        parameters,
        storage_root,
        &base_path,
        &work_dir,
    );
    let _ = fs::remove_dir_all(&work_dir);
    outcome
}

#[allow(clippy::too_many_arguments)]
fn execute_plan(
    service: &AssetService,
    base_asset: &Asset,
    backend: &dyn CustomizerBackend,
    backend_identifier: &str,
    parameters: &JsonMap,
    storage_root: &Path,
    base_path: &Path,
    work_dir: &Path,
) -> Result<CustomizationOutcome> {
    let schema = backend.load_schema(base_path)?;
    let session = backend.plan_build(base_path, &schema, parameters, work_dir, true)?;

    let schema_map = session.schema.to_map()?;
    let customization = service.create_customization(
        &base_asset.path,
        backend_identifier,
        Some(&schema_map),
        Some(&session.parameters),
    )?;

    let customization_root = storage_root
        .join("customizations")
        .join(base_asset.id.to_string())
        .join(customization.id.to_string());
    fs::create_dir_all(&customization_root).map_err(|e| Error::io(&customization_root, e))?;

    let mut outcomes: Vec<ArtifactOutcome> = Vec::new();
    for (index, artifact) in session.artifacts.iter().enumerate() {
        // Artifacts referencing an already-registered asset only gain a
        // lineage edge; nothing is copied.
        if let Some(asset_id) = artifact.asset_id {
            let existing = service.repository().get_asset(asset_id)?.ok_or_else(|| {
                Error::not_found(format!(
                    "generated artifact references unknown asset {asset_id}"
                ))
            })?;
            let relationship = service.repository().create_asset_relationship(
                customization.id,
                existing.id,
                &artifact.relationship,
            )?;
            outcomes.push(ArtifactOutcome {
                artifact: artifact.clone(),
                asset: existing,
                relationship,
            });
            continue;
        }

        let source_path = artifact.path.as_path();
        if !source_path.exists() {
            return Err(Error::not_found(format!(
                "generated artifact {} does not exist",
                source_path.display()
            )));
        }

        let proposed_name = match source_path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => format!("artifact_{}", index + 1),
        };
        let destination = allocate_destination(&customization_root, &proposed_name);
        fs::copy(source_path, &destination).map_err(|e| Error::io(&destination, e))?;

        let metadata = build_artifact_metadata(
            base_asset,
            &customization,
            backend_identifier,
            artifact,
            source_path,
            &destination,
            &session,
        )?;
        let label = artifact
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| proposed_name.clone());

        let destination_text = destination.to_string_lossy().into_owned();
        let created = service.create_asset(&destination_text, Some(&label), Some(&metadata), None);
        let asset = match created {
            Ok(asset) => asset,
            Err(err) => {
                // Leave no unmanaged file behind when registration fails.
                let _ = fs::remove_file(&destination);
                return Err(err);
            }
        };

        let (asset, relationship) = service.record_derivative(
            customization.id,
            &asset.path,
            &artifact.relationship,
            Some(&label),
            Some(&metadata),
        )?;
        outcomes.push(ArtifactOutcome {
            artifact: artifact.clone(),
            asset,
            relationship,
        });
    }

    let outcomes = patch_preview_entries(service, &customization, outcomes)?;

    Ok(CustomizationOutcome {
        base_asset: base_asset.clone(),
        customization,
        artifacts: outcomes,
        work_dir: work_dir.to_path_buf(),
    })
}

/// Collect preview-flavored artifacts and write the list into the
/// `customization.previews` block of every asset this run produced.
fn patch_preview_entries(
    service: &AssetService,
    customization: &Customization,
    outcomes: Vec<ArtifactOutcome>,
) -> Result<Vec<ArtifactOutcome>> {
    let entries = build_preview_entries(&outcomes);
    if entries.is_empty() {
        return Ok(outcomes);
    }

    let mut refreshed = Vec::with_capacity(outcomes.len());
    for mut outcome in outcomes {
        let mut metadata = outcome.asset.metadata.clone();
        let block = metadata
            .get("customization")
            .and_then(Value::as_object)
            .cloned();
        let Some(mut block) = block else {
            refreshed.push(outcome);
            continue;
        };
        if block.get("id").and_then(Value::as_i64) != Some(customization.id) {
            refreshed.push(outcome);
            continue;
        }

        block.insert("previews".to_string(), json!(entries));
        metadata.insert("customization".to_string(), Value::Object(block));
        outcome.asset = service.update_asset(outcome.asset.id, AssetUpdate::metadata(metadata))?;
        refreshed.push(outcome);
    }
    Ok(refreshed)
}

fn build_preview_entries(outcomes: &[ArtifactOutcome]) -> Vec<Value> {
    let mut entries = Vec::new();
    for outcome in outcomes {
        if !is_preview_artifact(&outcome.artifact, Path::new(&outcome.asset.path)) {
            continue;
        }

        let mut entry = JsonMap::new();
        entry.insert("asset_id".to_string(), json!(outcome.asset.id));
        entry.insert("path".to_string(), json!(outcome.asset.path));
        entry.insert(
            "relationship".to_string(),
            json!(outcome.artifact.relationship),
        );
        entry.insert("label".to_string(), json!(outcome.asset.label));

        let content_type = outcome
            .artifact
            .content_type
            .clone()
            .or_else(|| guess_content_type(&outcome.asset.path).map(str::to_string));
        if let Some(content_type) = content_type {
            entry.insert("content_type".to_string(), json!(content_type));
        }
        if let Some(managed) = outcome.asset.metadata.get("managed_path").and_then(Value::as_str) {
            entry.insert("managed_path".to_string(), json!(managed));
        }

        entries.push(Value::Object(entry));
    }
    entries
}

fn build_artifact_metadata(
    base_asset: &Asset,
    customization: &Customization,
    backend_identifier: &str,
    artifact: &GeneratedArtifact,
    source_path: &Path,
    destination: &Path,
    session: &BuildSession,
) -> Result<JsonMap> {
    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let source_modified_at = fs::metadata(&base_asset.path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(|mtime| DateTime::<Utc>::from(mtime).to_rfc3339_opts(SecondsFormat::Micros, true));

    let mut block = JsonMap::new();
    block.insert("id".to_string(), json!(customization.id));
    block.insert("backend".to_string(), json!(backend_identifier));
    block.insert("base_asset_id".to_string(), json!(base_asset.id));
    block.insert("base_asset_path".to_string(), json!(base_asset.path));
    block.insert("base_asset_label".to_string(), json!(base_asset.label));
    block.insert(
        "base_asset_updated_at".to_string(),
        json!(base_asset
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    block.insert("relationship".to_string(), json!(artifact.relationship));
    block.insert(
        "parameters".to_string(),
        Value::Object(customization.parameter_values.clone()),
    );
    block.insert("command".to_string(), json!(session.command));
    block.insert(
        "session_metadata".to_string(),
        Value::Object(session.metadata.clone()),
    );
    block.insert("generated_at".to_string(), json!(generated_at));
    block.insert("label".to_string(), json!(artifact.label));
    if is_preview_artifact(artifact, destination) {
        block.insert("is_preview".to_string(), json!(true));
    }
    if let Some(modified) = source_modified_at {
        block.insert("source_modified_at".to_string(), json!(modified));
    }

    let mut extra = JsonMap::new();
    if let Some(content_type) = &artifact.content_type {
        extra.insert("content_type".to_string(), json!(content_type));
    }
    extra.insert("customization".to_string(), Value::Object(block));

    build_asset_metadata(
        &base_asset.path,
        "customization",
        destination,
        Some(&source_path.to_string_lossy()),
        None,
        &[("generated_at", generated_at)],
        Some(&extra),
    )
}

fn is_preview_artifact(artifact: &GeneratedArtifact, destination: &Path) -> bool {
    let relationship = artifact.relationship.to_lowercase();
    if matches!(relationship.as_str(), "preview" | "thumbnail" | "render") {
        return true;
    }
    if artifact
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_lowercase().starts_with("image/"))
    {
        return true;
    }
    destination
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp"))
}

fn guess_content_type(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "stl" => Some("model/stl"),
        "obj" => Some("model/obj"),
        _ => None,
    }
}

fn work_directory_name(base_asset: &Asset, backend_identifier: &str) -> String {
    let seed = Path::new(&base_asset.path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| format!("asset_{}", base_asset.id));
    let safe_backend = backend_identifier.replace(['/', '\\'], "-");
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    format!("{seed}_{safe_backend}_{timestamp}")
}
