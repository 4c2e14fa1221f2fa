//! Import external model files into managed storage.
//!
//! Importing copies the source file into the managed root under a
//! collision-free name, extracts whatever cheap statistics the format
//! allows (triangle counts, bounding boxes, STEP units) and registers the
//! copy as an asset. The copy is removed again if registration fails, so a
//! failed import leaves no unmanaged file behind.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::db::Asset;
use crate::error::{Error, Result};
use crate::metadata::{build_asset_metadata, JsonMap};
use crate::service::AssetService;

/// Model formats the importer accepts, lowercase without the dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["stl", "obj", "step", "stp"];

/// Import the file at `path` into `storage_root` and register it.
///
/// The source must exist, be a regular file and carry a supported
/// extension. The asset's label is the source file stem and its metadata
/// carries the original and managed paths plus per-format statistics.
pub fn import_asset(service: &AssetService, path: &Path, storage_root: &Path) -> Result<Asset> {
    let source = fs::canonicalize(path)
        .map_err(|_| Error::not_found(format!("asset {} does not exist", path.display())))?;
    if !source.is_file() {
        return Err(Error::validation(format!(
            "asset {} is not a file",
            source.display()
        )));
    }

    let extension = source
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        let shown = if extension.is_empty() {
            "unknown"
        } else {
            extension.as_str()
        };
        return Err(Error::validation(format!(
            "unsupported asset format '{shown}'"
        )));
    }

    fs::create_dir_all(storage_root).map_err(|e| Error::io(storage_root, e))?;
    let file_name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("asset.{extension}"));
    let destination = allocate_destination(storage_root, &file_name);
    fs::copy(&source, &destination).map_err(|e| Error::io(&destination, e))?;

    let imported_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut extra = JsonMap::new();
    extra.insert("extension".to_string(), json!(extension.to_uppercase()));
    for (key, value) in extract_format_metadata(&destination, &extension) {
        extra.insert(key, value);
    }

    let registered = build_asset_metadata(
        &source.to_string_lossy(),
        "local",
        &destination,
        None,
        None,
        &[("imported_at", imported_at)],
        Some(&extra),
    )
    .and_then(|metadata| {
        let label = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        service.create_asset(
            &destination.to_string_lossy(),
            Some(&label),
            Some(&metadata),
            None,
        )
    });

    match registered {
        Ok(asset) => {
            tracing::debug!(source = %source.display(), managed = %asset.path, "imported asset");
            Ok(asset)
        }
        Err(err) => {
            let _ = fs::remove_file(&destination);
            Err(err)
        }
    }
}

/// First non-colliding path for `filename` inside `parent`, numbering the
/// stem (`part.stl`, `part_1.stl`, ...) until a free slot is found.
pub(crate) fn allocate_destination(parent: &Path, filename: &str) -> PathBuf {
    let candidate = parent.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let suffix = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1u32;
    loop {
        let candidate = parent.join(format!("{stem}_{counter}{suffix}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

// ============================================================================
// Per-format statistics
// ============================================================================

fn extract_format_metadata(path: &Path, extension: &str) -> JsonMap {
    match extension {
        "stl" => extract_stl_metadata(path),
        "obj" => extract_obj_metadata(path),
        "step" | "stp" => extract_step_metadata(path),
        _ => JsonMap::new(),
    }
}

/// Triangle count and bounds from an STL file. Binary layouts are
/// recognized by their exact size; everything else is treated as the ASCII
/// dialect. Unrecognizable payloads produce no statistics rather than an
/// error.
fn extract_stl_metadata(path: &Path) -> JsonMap {
    let Ok(bytes) = fs::read(path) else {
        return JsonMap::new();
    };

    let parsed = parse_binary_stl(&bytes).or_else(|| parse_ascii_stl(&bytes));
    let Some((face_count, bounds)) = parsed else {
        return JsonMap::new();
    };

    let mut metadata = JsonMap::new();
    if face_count > 0 {
        metadata.insert("face_count".to_string(), json!(face_count));
    }
    bounds.write_into(&mut metadata);
    metadata.insert("units".to_string(), json!("unspecified"));
    metadata
}

fn parse_binary_stl(bytes: &[u8]) -> Option<(u64, BoundingBox)> {
    if bytes.len() < 84 {
        return None;
    }
    let count = u32::from_le_bytes(bytes[80..84].try_into().ok()?) as usize;
    let expected = 84usize.checked_add(count.checked_mul(50)?)?;
    if bytes.len() != expected {
        return None;
    }

    let mut bounds = BoundingBox::default();
    for triangle in bytes[84..].chunks_exact(50) {
        // 12 bytes of normal, then three vertices of three f32 each.
        for vertex in 0..3 {
            let base = 12 + vertex * 12;
            let mut point = [0f64; 3];
            for (axis, slot) in point.iter_mut().enumerate() {
                let offset = base + axis * 4;
                let raw = triangle[offset..offset + 4].try_into().ok()?;
                *slot = f32::from_le_bytes(raw) as f64;
            }
            bounds.include(point);
        }
    }
    Some((count as u64, bounds))
}

fn parse_ascii_stl(bytes: &[u8]) -> Option<(u64, BoundingBox)> {
    let text = String::from_utf8_lossy(bytes);
    let mut faces = 0u64;
    let mut bounds = BoundingBox::default();

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("facet normal") {
            faces += 1;
        } else if let Some(rest) = strip_keyword(line, "vertex") {
            if let Some(point) = parse_triplet(rest) {
                bounds.include(point);
            }
        }
    }

    if faces == 0 && !bounds.seen {
        return None;
    }
    Some((faces, bounds))
}

/// Vertex/face counts and bounds from a Wavefront OBJ file.
fn extract_obj_metadata(path: &Path) -> JsonMap {
    let Ok(text) = fs::read_to_string(path) else {
        return JsonMap::new();
    };

    let mut vertices = 0u64;
    let mut faces = 0u64;
    let mut bounds = BoundingBox::default();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = strip_keyword(line, "v") {
            vertices += 1;
            if let Some(point) = parse_triplet(rest) {
                bounds.include(point);
            }
        } else if strip_keyword(line, "f").is_some() {
            faces += 1;
        }
    }

    if vertices == 0 && faces == 0 {
        return JsonMap::new();
    }
    let mut metadata = JsonMap::new();
    if vertices > 0 {
        metadata.insert("vertex_count".to_string(), json!(vertices));
    }
    if faces > 0 {
        metadata.insert("face_count".to_string(), json!(faces));
    }
    bounds.write_into(&mut metadata);
    metadata.insert("units".to_string(), json!("unspecified"));
    metadata
}

/// Coarse STEP statistics from a lightweight text scan: every
/// `CARTESIAN_POINT` contributes a vertex, and the first `SI_UNIT` block
/// names the length unit.
pub fn extract_step_metadata(path: &Path) -> JsonMap {
    let Ok(raw) = fs::read(path) else {
        return JsonMap::new();
    };
    // STEP is ASCII; uppercasing once makes every later match
    // case-insensitive.
    let payload = String::from_utf8_lossy(&raw).to_uppercase();

    let mut metadata = JsonMap::new();
    let points = step_points(&payload);
    if !points.is_empty() {
        let mut bounds = BoundingBox::default();
        for point in &points {
            bounds.include(*point);
        }
        metadata.insert("vertex_count".to_string(), json!(points.len()));
        bounds.write_into(&mut metadata);
        metadata.insert("face_count".to_string(), json!(0));
    }

    let units = step_unit(&payload).unwrap_or_else(|| "unspecified".to_string());
    metadata.insert("units".to_string(), json!(units));
    metadata
}

fn step_points(payload: &str) -> Vec<[f64; 3]> {
    let mut points = Vec::new();
    let mut rest = payload;
    while let Some(found) = rest.find("CARTESIAN_POINT") {
        rest = &rest[found + "CARTESIAN_POINT".len()..];
        if let Some(point) = parse_step_point(rest) {
            points.push(point);
        }
    }
    points
}

/// Parse `('label', (x, y, z))` from the text following the keyword.
fn parse_step_point(text: &str) -> Option<[f64; 3]> {
    let text = text.trim_start().strip_prefix('(')?;
    let comma = text.find(',')?;
    let text = text[comma + 1..].trim_start().strip_prefix('(')?;
    let close = text.find(')')?;

    let mut components = text[..close].split(',');
    let mut point = [0f64; 3];
    for slot in &mut point {
        // Fortran-style exponents show up in older exporters.
        let component = components.next()?.trim().replace('D', "E");
        *slot = component.parse().ok()?;
    }
    Some(point)
}

fn step_unit(payload: &str) -> Option<String> {
    let mut rest = payload;
    while let Some(found) = rest.find("SI_UNIT(") {
        rest = &rest[found + "SI_UNIT(".len()..];
        let close = rest.find(')')?;
        let content = &rest[..close];

        let parts: Vec<&str> = content
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        if parts.len() < 2 {
            continue;
        }

        let prefix_raw = if parts[0] == "$" { "" } else { parts[0] };
        let prefix = prefix_raw.trim_matches('.');
        let unit = parts[1].trim_matches('.');

        if unit != "METRE" {
            let label = unit.to_lowercase();
            return Some(if prefix.is_empty() {
                label
            } else {
                format!("{} {}", prefix.to_lowercase(), label)
            });
        }
        if prefix.is_empty() {
            return Some("metre".to_string());
        }
        return Some(
            step_prefix_label(prefix)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}metre", prefix.to_lowercase())),
        );
    }
    None
}

fn step_prefix_label(prefix: &str) -> Option<&'static str> {
    let label = match prefix {
        "ATTO" => "attometre",
        "CENTI" => "centimetre",
        "DECI" => "decimetre",
        "DEKA" => "dekametre",
        "EXA" => "exametre",
        "FEMTO" => "femtometre",
        "GIGA" => "gigametre",
        "HECTO" => "hectometre",
        "KILO" => "kilometre",
        "MEGA" => "megametre",
        "MICRO" => "micrometre",
        "MILLI" => "millimetre",
        "NANO" => "nanometre",
        "PETA" => "petametre",
        "PICO" => "picometre",
        "TERA" => "terametre",
        "YOCTO" => "yoctometre",
        "YOTTA" => "yottametre",
        "ZEPTO" => "zeptometre",
        "ZETTA" => "zettametre",
        _ => return None,
    };
    Some(label)
}

/// Lowercase keyword at the start of `line` followed by whitespace.
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if rest.starts_with(char::is_whitespace) {
        Some(rest.trim_start())
    } else {
        None
    }
}

fn parse_triplet(text: &str) -> Option<[f64; 3]> {
    let mut parts = text.split_whitespace();
    let mut point = [0f64; 3];
    for slot in &mut point {
        let value: f64 = parts.next()?.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        *slot = value;
    }
    Some(point)
}

#[derive(Debug, Default, Clone, Copy)]
struct BoundingBox {
    min: [f64; 3],
    max: [f64; 3],
    seen: bool,
}

impl BoundingBox {
    fn include(&mut self, point: [f64; 3]) {
        if !self.seen {
            self.min = point;
            self.max = point;
            self.seen = true;
            return;
        }
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
    }

    fn write_into(&self, metadata: &mut JsonMap) {
        if !self.seen {
            return;
        }
        let min: Vec<f64> = self.min.iter().map(|v| round6(*v)).collect();
        let max: Vec<f64> = self.max.iter().map(|v| round6(*v)).collect();
        metadata.insert("bounding_box_min".to_string(), json!(min));
        metadata.insert("bounding_box_max".to_string(), json!(max));
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}
