//! Version control for garden-core
//!
//! A [`VcsHandler`] answers three questions about the working tree: which
//! files belong to a directory (with their content hashes), where the
//! repository root is, and which branch/commit/remote a path is on. It also
//! manages the local cache of cloned remote sources.
//!
//! # Architecture
//!
//! - **git**: `GitHandler`, the git-backed implementation
//! - **exec**: async `git` subprocess executor
//! - **filter**: include/exclude glob matching
//! - **hash**: git blob hashing and version string hashing
//! - **remote**: remote source URLs, ref lists and cache paths
//! - **version**: tree and module versions, plus the version cache
//!
//! # File scan
//!
//! ```text
//! path ─► tracked + untracked ─► drop ignored ─► submodules (recurse)
//!                                                      │
//!                           sorted VcsFile list ◄─ hash ◄─ filter + symlinks
//! ```

pub mod exec;
pub mod filter;
pub mod git;
pub mod hash;
pub mod remote;
pub mod version;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use filter::PathFilter;
pub use git::GitHandler;
pub use hash::{hash_blob, hash_strings, NEW_MODULE_VERSION};
pub use remote::{get_commit_id_from_ref_list, parse_git_url, ParsedGitUrl, SourceType};
pub use version::{get_tree_version, resolve_module_version, ModuleConfig, VersionCache};

// ============================================================================
// Data types
// ============================================================================

/// One file owned by a scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VcsFile {
    /// Absolute path.
    pub path: PathBuf,
    /// Git blob id of the current content.
    pub hash: String,
}

/// Summary of a directory tree's version-controlled state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeVersion {
    pub content_hash: String,
    pub files: Vec<PathBuf>,
}

/// A module's tree version combined with the versions of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleVersion {
    pub version_string: String,
    pub dependency_versions: BTreeMap<String, String>,
    pub files: Vec<PathBuf>,
}

/// Branch, commit and origin of a path. Fields are empty when unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub branch: String,
    pub commit_hash: String,
    pub origin_url: String,
}

/// Arguments for [`VcsHandler::get_files`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetFilesParams {
    pub path: PathBuf,
    /// `None` includes everything; an empty list includes nothing.
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
}

impl GetFilesParams {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_include<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = Some(patterns.into_iter().map(Into::into).collect());
        self
    }
}

/// Arguments for the remote source operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSourceParams {
    /// `<transport>://<repository-path>#<ref>`
    pub url: String,
    pub name: String,
    pub source_type: SourceType,
    /// Fail instead of waiting for credentials on an interactive prompt.
    pub fail_on_prompt: bool,
}

impl RemoteSourceParams {
    pub fn new(name: impl Into<String>, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            source_type,
            fail_on_prompt: false,
        }
    }

    pub fn fail_on_prompt(mut self, fail: bool) -> Self {
        self.fail_on_prompt = fail;
        self
    }
}

// ============================================================================
// Handler trait
// ============================================================================

/// A version control backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VcsHandler: Send + Sync {
    /// Backend name, e.g. `"git"`.
    fn name(&self) -> &'static str;

    /// Root of the repository containing `path`.
    ///
    /// # Errors
    /// `GardenError::Runtime` with remediation advice if `path` is not
    /// inside a repository.
    async fn get_repo_root(&self, path: &Path) -> Result<PathBuf>;

    /// Branch, commit and origin URL for `path`. Never fails for a path
    /// without commits or outside a repository; fields are left empty.
    async fn get_path_info(&self, path: &Path) -> Result<PathInfo>;

    /// Files under `params.path`, sorted by path.
    ///
    /// A missing or non-directory path yields an empty list.
    async fn get_files(&self, params: &GetFilesParams) -> Result<Vec<VcsFile>>;

    /// Git blob id of a single file.
    async fn hash_object(&self, path: &Path) -> Result<String>;

    /// Clone a remote source if it is not cached yet. Returns its local path.
    async fn ensure_remote_source(&self, params: &RemoteSourceParams) -> Result<PathBuf>;

    /// Bring a cached remote source up to date with its ref.
    async fn update_remote_source(&self, params: &RemoteSourceParams) -> Result<()>;
}
