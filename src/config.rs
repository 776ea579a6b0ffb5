use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{Result, TaggrabError};
use crate::storage::models::Platform;

pub const DEFAULT_LIMIT: usize = 20;
pub const DEFAULT_DELAY_SECS: u64 = 1;

pub struct AppPaths {
    pub base_dir: PathBuf,
    pub db_path: PathBuf,
    pub json_tracker_path: PathBuf,
    pub settings_file: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let base = dirs::home_dir()
            .ok_or_else(|| TaggrabError::Config("could not determine home directory".into()))?
            .join(".taggrab");
        Ok(Self::from_base(base))
    }

    pub fn from_base(base: PathBuf) -> Self {
        Self {
            db_path: base.join("tracker.db"),
            json_tracker_path: base.join("downloaded_media.json"),
            settings_file: base.join("settings.json"),
            base_dir: base,
        }
    }

    pub fn ensure_base_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

/// Last-used choices, remembered between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: Option<PathBuf>,
    pub platform: Platform,
    pub delay_secs: u64,
    pub limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: None,
            platform: Platform::Instagram,
            delay_secs: DEFAULT_DELAY_SECS,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl Settings {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load(path: &Path) -> Settings {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read settings, using defaults");
                return Settings::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt settings file, using defaults");
                Settings::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
    }
}

/// Write via a sibling temp file and rename so readers never see a torn file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
