use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override for the library root, checked on every load.
pub const LIBRARY_PATH_ENV: &str = "MODELVAULT_LIBRARY_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub gcode_previews: GcodePreviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root directory holding container folders and loose model files.
    #[serde(default = "default_library_root")]
    pub root: PathBuf,
}

fn default_library_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Models")
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_library_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_model_extensions")]
    pub model_extensions: Vec<String>,
}

pub(crate) fn default_model_extensions() -> Vec<String> {
    vec![
        "stl".to_string(),
        "obj".to_string(),
        "3mf".to_string(),
        "step".to_string(),
        "stp".to_string(),
    ]
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            model_extensions: default_model_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnail_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumbnail_width")]
    pub width: u32,

    #[serde(default = "default_thumbnail_height")]
    pub height: u32,
}

fn default_thumbnail_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelvault")
        .join("thumbnails")
}

fn default_thumbnail_width() -> u32 {
    512
}

fn default_thumbnail_height() -> u32 {
    512
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumbnail_path(),
            width: default_thumbnail_width(),
            height: default_thumbnail_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcodePreviewConfig {
    #[serde(default = "default_gcode_preview_path")]
    pub path: PathBuf,

    #[serde(default = "default_gcode_preview_width")]
    pub width: u32,

    #[serde(default = "default_gcode_preview_height")]
    pub height: u32,
}

fn default_gcode_preview_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelvault")
        .join("gcode_previews")
}

fn default_gcode_preview_width() -> u32 {
    768
}

fn default_gcode_preview_height() -> u32 {
    512
}

impl Default for GcodePreviewConfig {
    fn default() -> Self {
        Self {
            path: default_gcode_preview_path(),
            width: default_gcode_preview_width(),
            height: default_gcode_preview_height(),
        }
    }
}

/// Database location used when no configuration overrides it.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelvault")
        .join("assets.sqlite3")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            library: LibraryConfig::default(),
            scanner: ScannerConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            gcode_previews: GcodePreviewConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load from an explicit file, creating it with defaults when missing.
    /// The `MODELVAULT_LIBRARY_PATH` environment variable overrides the
    /// configured library root either way.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_override(path, std::env::var(LIBRARY_PATH_ENV).ok())
    }

    /// `load_from` with the library override taken as a parameter instead
    /// of read from the environment.
    fn load_with_override(path: impl AsRef<Path>, library_root: Option<String>) -> Result<Self> {
        let config_path = path.as_ref();

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(config_path)?;
            config
        };

        if let Some(root) = library_root {
            if !root.trim().is_empty() {
                config.library.root = PathBuf::from(root);
            }
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    fn save_to(&self, config_path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("modelvault")
            .join("config.toml")
    }
}
