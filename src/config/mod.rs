//! Configuration for garden-core
//!
//! Settings are read from a JSON file (every field is optional) and can be
//! overridden from the environment:
//!
//! | Variable                  | Field                  |
//! |---------------------------|------------------------|
//! | `GARDEN_DIR`              | `vcs.garden_dir`       |
//! | `GARDEN_IGNORE_FILE`      | `vcs.ignore_file`      |
//! | `GARDEN_HASH_CONCURRENCY` | `vcs.hash_concurrency` |
//! | `GARDEN_GIT_TIMEOUT_SECS` | `vcs.git_timeout_secs` |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GardenError, Result};
use crate::vcs::SourceType;

pub const DEFAULT_GARDEN_DIR: &str = ".garden";
pub const DEFAULT_IGNORE_FILE: &str = ".gardenignore";
pub const DEFAULT_HASH_CONCURRENCY: usize = 16;

// ============================================================================
// Config
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vcs: VcsConfig,
    pub plugins: PluginsConfig,
}

/// Settings for the VCS handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsConfig {
    /// Root of garden's working state, including the remote source cache.
    pub garden_dir: PathBuf,

    /// Per-directory ignore file name. Empty disables ignore files.
    pub ignore_file: String,

    /// Maximum number of files hashed concurrently.
    pub hash_concurrency: usize,

    /// Timeout for network git operations. 0 waits indefinitely.
    pub git_timeout_secs: u64,

    /// Local checkouts that replace cloned remote sources.
    pub linked_sources: Vec<LinkedSource>,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            garden_dir: PathBuf::from(DEFAULT_GARDEN_DIR),
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            hash_concurrency: DEFAULT_HASH_CONCURRENCY,
            git_timeout_secs: 0,
            linked_sources: Vec::new(),
        }
    }
}

impl VcsConfig {
    pub fn git_timeout(&self) -> Option<Duration> {
        (self.git_timeout_secs > 0).then(|| Duration::from_secs(self.git_timeout_secs))
    }
}

/// A remote source replaced by a local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedSource {
    pub name: String,
    pub source_type: SourceType,
    pub path: PathBuf,
}

/// Plugin settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Configured provider names, in configuration order.
    pub providers: Vec<String>,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults. Environment overrides are not
    /// applied; see [`Config::apply_env_overrides`].
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            GardenError::Configuration(format!(
                "Invalid config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply `GARDEN_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("GARDEN_DIR") {
            self.vcs.garden_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup("GARDEN_IGNORE_FILE") {
            self.vcs.ignore_file = name;
        }
        if let Some(value) = lookup("GARDEN_HASH_CONCURRENCY") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => self.vcs.hash_concurrency = n,
                _ => warn!(value = %value, "Ignoring invalid GARDEN_HASH_CONCURRENCY"),
            }
        }
        if let Some(value) = lookup("GARDEN_GIT_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(secs) => self.vcs.git_timeout_secs = secs,
                Err(_) => warn!(value = %value, "Ignoring invalid GARDEN_GIT_TIMEOUT_SECS"),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
