//! Tree and module versions.
//!
//! A tree version hashes the content of every file a module owns. A module
//! version folds in the module's resolved configuration and the versions of
//! its dependencies, so a change anywhere upstream changes the version
//! string. Module versions are memoized in a [`VersionCache`] keyed by the
//! module name and a context derived from its configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;

use super::hash::{hash_strings, NEW_MODULE_VERSION};
use super::{GetFilesParams, ModuleVersion, TreeVersion, VcsHandler};

/// First part of every version cache key.
pub const MODULE_VERSIONS_KEY: &str = "moduleVersions";

/// The parts of a resolved module configuration that affect its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub name: String,
    /// Module root directory.
    pub path: PathBuf,
    /// Config file the module was declared in. Excluded from its files.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
    /// Type-specific configuration, after template resolution.
    #[serde(default)]
    pub spec: Value,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            config_path: None,
            include: None,
            exclude: None,
            spec: Value::Null,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }
}

/// Canonical serialization of a module config.
///
/// Objects serialize with sorted keys, so two configs that parse to the same
/// value always produce the same string regardless of source formatting.
pub fn serialize_config(config: &ModuleConfig) -> Result<String> {
    Ok(serde_json::to_string(config)?)
}

/// Cache context for a module: a hash of its config and dependency versions.
pub fn config_context(
    config: &ModuleConfig,
    dependency_versions: &BTreeMap<String, String>,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serialize_config(config)?.as_bytes());
    for (name, version) in dependency_versions {
        hasher.update(b"\0");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(version.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// Version cache
// ============================================================================

/// Memoized module versions.
///
/// Entries live under `["moduleVersions", <module name>]` and are further
/// keyed by a config context, so a changed configuration misses the cache
/// without explicit invalidation.
///
/// The context does not cover file content. Whoever observes a change to a
/// module's files must call [`VersionCache::invalidate`] for that module;
/// until then [`resolve_module_version`] keeps returning the cached version
/// without listing files again.
#[derive(Debug, Default)]
pub struct VersionCache {
    entries: Mutex<HashMap<Vec<String>, HashMap<String, ModuleVersion>>>,
}

impl VersionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_key(module_name: &str) -> Vec<String> {
        vec![MODULE_VERSIONS_KEY.to_string(), module_name.to_string()]
    }

    pub fn get(&self, module_name: &str, context: &str) -> Option<ModuleVersion> {
        self.lock()
            .get(&Self::cache_key(module_name))
            .and_then(|contexts| contexts.get(context))
            .cloned()
    }

    pub fn set(&self, module_name: &str, context: &str, version: ModuleVersion) {
        self.lock()
            .entry(Self::cache_key(module_name))
            .or_default()
            .insert(context.to_string(), version);
    }

    /// Drop every cached version of a module. Returns whether any existed.
    pub fn invalidate(&self, module_name: &str) -> bool {
        self.lock().remove(&Self::cache_key(module_name)).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Vec<String>, HashMap<String, ModuleVersion>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Version of the files a module owns.
///
/// The module's own config file is left out of both the hash and the file
/// list. An empty tree gets [`NEW_MODULE_VERSION`].
pub async fn get_tree_version(
    handler: &dyn VcsHandler,
    config: &ModuleConfig,
) -> Result<TreeVersion> {
    let params = GetFilesParams {
        path: config.path.clone(),
        include: config.include.clone(),
        exclude: config.exclude.clone(),
    };

    let files: Vec<_> = handler
        .get_files(&params)
        .await?
        .into_iter()
        .filter(|f| config.config_path.as_ref() != Some(&f.path))
        .collect();

    let mut hashes: Vec<&str> = files.iter().map(|f| f.hash.as_str()).collect();
    hashes.sort_unstable();

    let content_hash = if hashes.is_empty() {
        NEW_MODULE_VERSION.to_string()
    } else {
        hash_strings(&hashes)
    };

    Ok(TreeVersion {
        content_hash,
        files: files.into_iter().map(|f| f.path).collect(),
    })
}

/// Version of a module given the versions of its dependencies.
///
/// Served from `cache` when the config context matches, without touching
/// the working tree. See [`VersionCache`] for invalidation on content changes.
///
/// # Arguments
/// * `handler` - VCS backend used to list the module's files
/// * `cache` - Memoized versions, consulted first and filled on a miss
/// * `config` - Resolved module configuration
/// * `dependency_versions` - Version string of each dependency, by module name
pub async fn resolve_module_version(
    handler: &dyn VcsHandler,
    cache: &VersionCache,
    config: &ModuleConfig,
    dependency_versions: &BTreeMap<String, String>,
) -> Result<ModuleVersion> {
    let context = config_context(config, dependency_versions)?;
    if let Some(cached) = cache.get(&config.name, &context) {
        debug!(module = %config.name, version = %cached.version_string, "Module version cache hit");
        return Ok(cached);
    }

    let tree = get_tree_version(handler, config).await?;

    let mut parts = vec![serialize_config(config)?, tree.content_hash];
    for (name, version) in dependency_versions {
        parts.push(name.clone());
        parts.push(version.clone());
    }

    let version = ModuleVersion {
        version_string: hash_strings(&parts),
        dependency_versions: dependency_versions.clone(),
        files: tree.files,
    };

    debug!(module = %config.name, version = %version.version_string, "Resolved module version");
    cache.set(&config.name, &context, version.clone());
    Ok(version)
}
