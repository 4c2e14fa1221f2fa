//! Content-addressed cache for rendered preview artifacts.
//!
//! Artifacts are keyed by (source content hash, render-parameter hash,
//! output size), so identical inputs always land in the same file under the
//! cache root. Callers keep the returned `info` descriptor next to the
//! owning asset and hand it back on the next call; while it still matches,
//! the cache answers without touching the renderer.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::metadata::JsonMap;

/// Render parameters, keyed by lowercase hint name. The sorted map doubles
/// as the canonical form hashed into the artifact filename.
pub type RenderParams = BTreeMap<String, String>;

/// Sentinel used in place of a parameter hash when no hints were supplied,
/// so "no hints" never collides with a real hash.
const NO_HINT_SENTINEL: &str = "nohint";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// The source file is missing or cannot be read.
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source parsed but contains nothing renderable.
    #[error("{0}")]
    Unsupported(String),

    /// The renderer itself failed.
    #[error("render failed: {0}")]
    Failed(String),

    /// Writing or reading the cached artifact failed.
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RenderError::Unreadable {
            path: path.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RenderError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Encoded image plus an optional renderer-specific summary, recorded as
/// the `analysis` field of the info descriptor.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub bytes: Vec<u8>,
    pub analysis: Option<Value>,
}

/// Produces the raster artifact the cache stores. Implementations live
/// outside this layer (mesh rasterizer, toolpath plotter).
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        source: &Path,
        params: &RenderParams,
        size: (u32, u32),
    ) -> Result<RenderOutput, RenderError>;
}

/// Result of a cache lookup or render.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub path: PathBuf,
    pub info: JsonMap,
    pub bytes: Vec<u8>,
    /// False only when the caller's stored descriptor still matched.
    pub updated: bool,
}

pub struct ContentCache {
    root: PathBuf,
    renderer: Box<dyn Renderer>,
}

impl fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, renderer: Box<dyn Renderer>) -> Self {
        ContentCache {
            root: root.into(),
            renderer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the artifact for `source`, rendering only when no cached file
    /// exists yet.
    ///
    /// When the file exists and `existing_info` matches it exactly, the
    /// caller's descriptor is returned verbatim (preserving its
    /// `generated_at`) with `updated = false`. A present file with a stale
    /// descriptor gets a fresh descriptor without re-rendering.
    pub fn get_or_render(
        &self,
        source: &Path,
        params: &RenderParams,
        size: (u32, u32),
        existing_info: Option<&JsonMap>,
    ) -> Result<CacheOutcome, RenderError> {
        let source_hash = hash_source(source)?;
        let hint_hash = hash_params(params);
        let path = self.artifact_path(&source_hash, &hint_hash, size);

        if path.exists() {
            let bytes = fs::read(&path).map_err(|e| RenderError::io(&path, e))?;
            if info_matches(existing_info, &path, &source_hash, &hint_hash, params, size) {
                let info = existing_info.cloned().unwrap_or_default();
                return Ok(CacheOutcome {
                    path,
                    info,
                    bytes,
                    updated: false,
                });
            }
            let info = build_info(&path, &source_hash, &hint_hash, params, size, None);
            return Ok(CacheOutcome {
                path,
                info,
                bytes,
                updated: true,
            });
        }

        debug!(source = %source.display(), artifact = %path.display(), "rendering cache artifact");
        let output = self.renderer.render(source, params, size)?;
        fs::create_dir_all(&self.root).map_err(|e| RenderError::io(&self.root, e))?;
        fs::write(&path, &output.bytes).map_err(|e| RenderError::io(&path, e))?;
        let info = build_info(&path, &source_hash, &hint_hash, params, size, output.analysis);

        Ok(CacheOutcome {
            path,
            info,
            bytes: output.bytes,
            updated: true,
        })
    }

    fn artifact_path(&self, source_hash: &str, hint_hash: &str, size: (u32, u32)) -> PathBuf {
        self.root
            .join(format!("{source_hash}_{hint_hash}_{}x{}.png", size.0, size.1))
    }
}

fn hash_source(path: &Path) -> Result<String, RenderError> {
    let file = File::open(path).map_err(|e| RenderError::unreadable(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| RenderError::unreadable(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_params(params: &RenderParams) -> String {
    if params.is_empty() {
        return NO_HINT_SENTINEL.to_string();
    }
    // BTreeMap iteration order makes the JSON canonical.
    let encoded = serde_json::to_string(params).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(encoded.as_bytes()));
    digest[..16].to_string()
}

fn info_matches(
    info: Option<&JsonMap>,
    cache_path: &Path,
    source_hash: &str,
    hint_hash: &str,
    params: &RenderParams,
    size: (u32, u32),
) -> bool {
    let Some(info) = info else {
        return false;
    };

    if info.get("source_hash").and_then(|v| v.as_str()) != Some(source_hash) {
        return false;
    }
    if info.get("hint_hash").and_then(|v| v.as_str()) != Some(hint_hash) {
        return false;
    }

    let stored_size = match info.get("size").and_then(|v| v.as_array()) {
        Some(values) if values.len() == 2 => values,
        _ => return false,
    };
    if stored_size[0].as_u64() != Some(u64::from(size.0))
        || stored_size[1].as_u64() != Some(u64::from(size.1))
    {
        return false;
    }

    let stored_path = match info.get("path").and_then(|v| v.as_str()) {
        Some(text) if !text.is_empty() => text,
        _ => return false,
    };
    let (Ok(stored), Ok(current)) = (Path::new(stored_path).canonicalize(), cache_path.canonicalize())
    else {
        return false;
    };
    if stored != current {
        return false;
    }

    let stored_hints: RenderParams = info
        .get("hints")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(key, value)| value.as_str().map(|text| (key.clone(), text.to_string())))
                .collect()
        })
        .unwrap_or_default();
    &stored_hints == params
}

fn build_info(
    path: &Path,
    source_hash: &str,
    hint_hash: &str,
    params: &RenderParams,
    size: (u32, u32),
    analysis: Option<Value>,
) -> JsonMap {
    let mut info = JsonMap::new();
    info.insert(
        "path".to_string(),
        Value::String(path.to_string_lossy().into_owned()),
    );
    info.insert(
        "source_hash".to_string(),
        Value::String(source_hash.to_string()),
    );
    info.insert("hint_hash".to_string(), Value::String(hint_hash.to_string()));
    info.insert(
        "hints".to_string(),
        Value::Object(
            params
                .iter()
                .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                .collect(),
        ),
    );
    info.insert("size".to_string(), serde_json::json!([size.0, size.1]));
    info.insert(
        "generated_at".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    if let Some(analysis) = analysis {
        info.insert("analysis".to_string(), analysis);
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct CountingRenderer {
        bytes: Vec<u8>,
        analysis: Option<Value>,
        calls: Arc<AtomicUsize>,
    }

    impl CountingRenderer {
        fn new(bytes: &[u8]) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                CountingRenderer {
                    bytes: bytes.to_vec(),
                    analysis: None,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    impl Renderer for CountingRenderer {
        fn render(
            &self,
            _source: &Path,
            _params: &RenderParams,
            _size: (u32, u32),
        ) -> Result<RenderOutput, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RenderOutput {
                bytes: self.bytes.clone(),
                analysis: self.analysis.clone(),
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
        ) -> Result<RenderOutput, RenderError> {
            Err(RenderError::Failed("synthetic failure".to_string()))
        }
    }

    /// Renderer producing a real encoded PNG at the requested size.
    struct PngRenderer;

    impl Renderer for PngRenderer {
        fn render(
            &self,
            _source: &Path,
            _params: &RenderParams,
            size: (u32, u32),
        ) -> Result<RenderOutput, RenderError> {
            let canvas =
                image::RgbaImage::from_pixel(size.0, size.1, image::Rgba([30, 144, 255, 255]));
            let mut bytes = Vec::new();
            image::DynamicImage::ImageRgba8(canvas)
                .write_to(
                    &mut std::io::Cursor::new(&mut bytes),
                    image::ImageFormat::Png,
                )
                .map_err(|e| RenderError::Failed(e.to_string()))?;
            Ok(RenderOutput {
                bytes,
                analysis: None,
            })
        }
    }

    fn source_file(dir: &Path, contents: &[u8]) -> PathBuf {
        let path = dir.join("model.stl");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn first_render_writes_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"solid cube");
        let (renderer, calls) = CountingRenderer::new(b"png-bytes");
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(renderer));

        let outcome = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap();

        assert!(outcome.updated);
        assert_eq!(outcome.bytes, b"png-bytes");
        assert_eq!(fs::read(&outcome.path).unwrap(), b"png-bytes");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for key in ["path", "source_hash", "hint_hash", "hints", "size", "generated_at"] {
            assert!(outcome.info.contains_key(key), "missing info key {key}");
        }
        assert_eq!(outcome.info.get("hint_hash"), Some(&Value::String("nohint".into())));
        assert_eq!(outcome.info.get("size"), Some(&serde_json::json!([64, 64])));
    }

    #[test]
    fn matching_info_short_circuits_the_renderer() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"solid cube");
        let (renderer, calls) = CountingRenderer::new(b"png-bytes");
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(renderer));

        let first = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap();
        let second = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), Some(&first.info))
            .unwrap();

        assert!(!second.updated);
        // The caller's descriptor comes back verbatim, timestamp included.
        assert_eq!(second.info, first.info);
        assert_eq!(second.bytes, first.bytes);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_info_is_rebuilt_without_rerendering() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"solid cube");
        let (renderer, calls) = CountingRenderer::new(b"png-bytes");
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(renderer));

        let first = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap();
        let mut stale = first.info.clone();
        stale.insert("source_hash".to_string(), Value::String("bogus".into()));

        let second = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), Some(&stale))
            .unwrap();

        assert!(second.updated);
        assert_eq!(second.bytes, first.bytes);
        assert_eq!(
            second.info.get("source_hash"),
            first.info.get("source_hash")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn params_produce_distinct_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"solid cube");
        let (renderer, _calls) = CountingRenderer::new(b"png-bytes");
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(renderer));

        let plain = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap();
        let mut params = RenderParams::new();
        params.insert("background".to_string(), "black".to_string());
        let hinted = cache
            .get_or_render(&source, &params, (64, 64), None)
            .unwrap();

        assert_ne!(plain.path, hinted.path);
        assert!(plain
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("_nohint_"));
        assert_eq!(
            hinted.info.get("hints"),
            Some(&serde_json::json!({"background": "black"}))
        );
    }

    #[test]
    fn missing_source_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let (renderer, _calls) = CountingRenderer::new(b"png-bytes");
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(renderer));

        let err = cache
            .get_or_render(&dir.path().join("ghost.stl"), &RenderParams::new(), (64, 64), None)
            .unwrap_err();
        assert!(matches!(err, RenderError::Unreadable { .. }));
    }

    #[test]
    fn renderer_failure_propagates_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"solid cube");
        let cache_root = dir.path().join("cache");
        let cache = ContentCache::new(&cache_root, Box::new(FailingRenderer));

        let err = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap_err();
        assert!(matches!(err, RenderError::Failed(_)));
        assert!(!cache_root.exists());
    }

    #[test]
    fn renderer_analysis_lands_in_the_info() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"G1 X5");
        let calls = Arc::new(AtomicUsize::new(0));
        let renderer = CountingRenderer {
            bytes: b"png-bytes".to_vec(),
            analysis: Some(serde_json::json!({"command_count": 1})),
            calls,
        };
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(renderer));

        let outcome = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap();
        assert_eq!(
            outcome.info.get("analysis"),
            Some(&serde_json::json!({"command_count": 1}))
        );

        // Rebuilding a stale descriptor from the on-disk artifact does not
        // re-run the renderer, so the analysis block is gone.
        let rebuilt = cache
            .get_or_render(&source, &RenderParams::new(), (64, 64), None)
            .unwrap();
        assert!(rebuilt.updated);
        assert!(!rebuilt.info.contains_key("analysis"));
    }

    #[test]
    fn cached_artifacts_decode_at_the_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_file(dir.path(), b"solid cube");
        let cache = ContentCache::new(dir.path().join("cache"), Box::new(PngRenderer));

        let outcome = cache
            .get_or_render(&source, &RenderParams::new(), (48, 32), None)
            .unwrap();

        let decoded = image::load_from_memory(&fs::read(&outcome.path).unwrap()).unwrap();
        assert_eq!(decoded.width(), 48);
        assert_eq!(decoded.height(), 32);
    }
}
