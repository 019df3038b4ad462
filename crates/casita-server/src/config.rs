//! Server configuration
//!
//! One YAML file describing the storage directory, the demo covers to
//! create at startup, and the sources to run the reverse cover flow
//! for.

use std::path::{Path, PathBuf};

use casita_components::demo::DemoCoverConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Config loading errors
#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// The server's YAML configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Directory holding persisted runtime data (`.storage/`)
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Demo covers created at startup
    #[serde(default)]
    pub demo_covers: Vec<DemoCoverConfig>,

    /// Source cover entity ids to configure a reverse cover for
    ///
    /// Each runs through the config flow at startup; sources that are
    /// already configured abort harmlessly, so restarts are idempotent.
    #[serde(default)]
    pub reverse_covers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            demo_covers: Vec::new(),
            reverse_covers: Vec::new(),
        }
    }
}

fn default_config_dir() -> PathBuf {
    PathBuf::from(".")
}

impl ServerConfig {
    /// Load the configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading server config");

        let content = std::fs::read_to_string(path).map_err(|source| ServerConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ServerConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
