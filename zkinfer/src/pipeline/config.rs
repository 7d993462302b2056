//! Pipeline configuration, loadable from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compiler::settings::SettingsConfig;
use crate::srs::SrsConfig;

/// Everything a pipeline run needs besides its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root of the on-disk artifact cache. `None` disables caching.
    pub artifact_dir: Option<PathBuf>,
    pub srs: SrsConfig,
    pub settings: SettingsConfig,
    /// Whether runs end with key setup.
    pub run_setup: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            srs: SrsConfig::default(),
            settings: SettingsConfig::default(),
            run_setup: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl PipelineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
