//! Tether configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Filesystem roots the link manager operates on.
///
/// Worker processes of the same daemon family must agree on `run_dir`:
/// it holds the claim index and the device database, which are the only
/// coordination state shared between racing workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkerConfig {
    /// Device filesystem root where nodes and links are published
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,

    /// Runtime state directory (claim index, device records)
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            dev_dir: default_dev_dir(),
            run_dir: default_run_dir(),
        }
    }
}

impl LinkerConfig {
    /// Load configuration from a YAML file, falling back to the defaults
    /// when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(config)
    }

    /// Claim index root: one directory per stable link name
    pub fn links_dir(&self) -> PathBuf {
        self.run_dir.join("links")
    }

    /// Device record directory, keyed by device id
    pub fn data_dir(&self) -> PathBuf {
        self.run_dir.join("data")
    }
}

fn default_dev_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run/tether")
}
