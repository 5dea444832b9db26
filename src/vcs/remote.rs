//! Remote source helpers.
//!
//! Remote sources are git repositories referenced as
//! `<transport>://<repository-path>#<ref>`, where the ref is a branch, tag
//! or commit. Each one is cloned into
//! `<garden-dir>/sources/<source-type>/<name>--<url-hash>`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GardenError, Result};

use super::hash::hash_repo_url;

/// Directory under the garden dir that holds cloned sources.
pub const SOURCES_DIR: &str = "sources";

/// Whether a remote source backs a module or the whole project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Module,
    Project,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Module => "module",
            SourceType::Project => "project",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = GardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "module" => Ok(SourceType::Module),
            "project" => Ok(SourceType::Project),
            other => Err(GardenError::Configuration(format!(
                "Invalid source type '{}': expected 'module' or 'project'",
                other
            ))),
        }
    }
}

/// A remote repository URL split at its `#ref` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedGitUrl {
    pub repository_url: String,
    /// Branch, tag or commit to check out.
    pub hash: String,
}

impl fmt::Display for ParsedGitUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository_url, self.hash)
    }
}

/// Split a remote source URL into repository URL and ref.
///
/// # Errors
/// `GardenError::Configuration` if the URL has no `#ref` suffix.
pub fn parse_git_url(url: &str) -> Result<ParsedGitUrl> {
    match url.split_once('#') {
        Some((repository_url, hash)) if !repository_url.is_empty() && !hash.is_empty() => {
            Ok(ParsedGitUrl {
                repository_url: repository_url.to_string(),
                hash: hash.to_string(),
            })
        }
        _ => Err(GardenError::Configuration(format!(
            "Repository URLs must contain a hash part pointing to a specific branch, tag or commit (e.g. https://github.com/org/repo.git#main). Got: '{}'",
            url
        ))),
    }
}

/// Commit id from `git ls-remote` style lines.
///
/// Each line is `<sha>\t<ref>` or a bare `<sha>`; the first line wins.
pub fn get_commit_id_from_ref_list<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    let first = lines.iter().map(AsRef::as_ref).find(|l| !l.trim().is_empty())?;
    let sha = first.split('\t').next().unwrap_or(first).trim();
    Some(sha.to_string())
}

/// Cache directory of a remote source, relative to the garden dir.
pub fn remote_source_rel_path(name: &str, url: &str, source_type: SourceType) -> PathBuf {
    PathBuf::from(SOURCES_DIR)
        .join(source_type.as_str())
        .join(format!("{}--{}", name, hash_repo_url(url)))
}
