//! Git-backed VCS handler.
//!
//! File listing is driven by `git ls-files`: tracked files come with their
//! index hashes, untracked files are hashed locally, and files matched by the
//! configured ignore file are dropped whether tracked or not. Populated
//! submodules are scanned recursively; missing or uninitialized ones are
//! skipped.
//!
//! Remote sources are shallow-fetched into
//! `<garden-dir>/sources/<type>/<name>--<url-hash>`, one writer per cache
//! slot at a time.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::config::VcsConfig;
use crate::error::{GardenError, Result};

use super::exec::{is_auth_failure, is_not_a_repository, GitExecutor};
use super::filter::PathFilter;
use super::hash;
use super::remote::{
    get_commit_id_from_ref_list, parse_git_url, remote_source_rel_path, ParsedGitUrl, SourceType,
};
use super::{GetFilesParams, PathInfo, RemoteSourceParams, VcsFile, VcsHandler};

/// Index mode of a submodule entry.
const GITLINK_MODE: &str = "160000";

type SlotLock = Arc<tokio::sync::Mutex<()>>;

/// A listed file, with its index hash when that is known to be current.
#[derive(Debug, Clone)]
struct ScanEntry {
    path: PathBuf,
    hash: Option<String>,
}

/// One `git ls-files -s --cached --others` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LsFilesRecord<'a> {
    Tracked {
        path: &'a str,
        mode: &'a str,
        hash: &'a str,
        stage: &'a str,
    },
    Untracked(&'a str),
}

fn parse_record(record: &str) -> LsFilesRecord<'_> {
    if let Some((meta, path)) = record.split_once('\t') {
        let mut parts = meta.split(' ');
        if let (Some(mode), Some(hash), Some(stage), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        {
            if mode.len() == 6 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return LsFilesRecord::Tracked {
                    path,
                    mode,
                    hash,
                    stage,
                };
            }
        }
    }
    LsFilesRecord::Untracked(record)
}

// ============================================================================
// GitHandler
// ============================================================================

/// VCS handler backed by the `git` binary.
///
/// # Example
///
/// ```rust,no_run
/// use garden_core::config::VcsConfig;
/// use garden_core::vcs::{GetFilesParams, GitHandler, VcsHandler};
///
/// # tokio_test::block_on(async {
/// let handler = GitHandler::new(&VcsConfig::default());
/// let files = handler
///     .get_files(&GetFilesParams::new(".").with_exclude(["target"]))
///     .await
///     .unwrap();
/// for file in files {
///     println!("{} {}", file.hash, file.path.display());
/// }
/// # })
/// ```
pub struct GitHandler {
    garden_dir: PathBuf,
    ignore_file: String,
    hash_concurrency: usize,
    /// Executor for local, read-mostly commands.
    git: GitExecutor,
    /// Executor for commands that talk to remotes.
    network: GitExecutor,
    linked: RwLock<HashMap<(SourceType, String), PathBuf>>,
    slots: Mutex<HashMap<PathBuf, SlotLock>>,
}

impl GitHandler {
    pub fn new(config: &VcsConfig) -> Self {
        let linked = config
            .linked_sources
            .iter()
            .map(|s| ((s.source_type, s.name.clone()), s.path.clone()))
            .collect();

        Self {
            garden_dir: config.garden_dir.clone(),
            ignore_file: config.ignore_file.clone(),
            hash_concurrency: config.hash_concurrency.max(1),
            git: GitExecutor::default(),
            network: GitExecutor::with_timeout(config.git_timeout()),
            linked: RwLock::new(linked),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cache directory a remote source is cloned into.
    pub fn remote_source_path(&self, name: &str, url: &str, source_type: SourceType) -> PathBuf {
        self.garden_dir
            .join(remote_source_rel_path(name, url, source_type))
    }

    /// Local path of a remote source: its linked directory if it has one,
    /// otherwise its cache directory.
    pub fn get_remote_source_path(&self, params: &RemoteSourceParams) -> PathBuf {
        self.linked_path(&params.name, params.source_type)
            .unwrap_or_else(|| {
                self.remote_source_path(&params.name, &params.url, params.source_type)
            })
    }

    /// Use a local directory in place of a remote source.
    pub fn link_remote_source(
        &self,
        name: &str,
        source_type: SourceType,
        path: impl Into<PathBuf>,
    ) {
        let path = path.into();
        info!(
            source = %name,
            source_type = %source_type,
            path = %path.display(),
            "Linked remote source"
        );
        self.linked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((source_type, name.to_string()), path);
    }

    /// Remove a link. Returns whether the source was linked.
    pub fn unlink_remote_source(&self, name: &str, source_type: SourceType) -> bool {
        let removed = self
            .linked
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(source_type, name.to_string()))
            .is_some();
        if removed {
            info!(source = %name, source_type = %source_type, "Unlinked remote source");
        }
        removed
    }

    fn linked_path(&self, name: &str, source_type: SourceType) -> Option<PathBuf> {
        self.linked
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(source_type, name.to_string()))
            .cloned()
    }

    fn slot_lock(&self, path: &Path) -> SlotLock {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    #[cfg(test)]
    fn with_git_config(mut self, key: &str, value: &str) -> Self {
        self.git = self.git.with_config(key, value);
        self.network = self.network.with_config(key, value);
        self
    }

    fn network_exec(&self, fail_on_prompt: bool) -> GitExecutor {
        if fail_on_prompt {
            self.network.non_interactive()
        } else {
            self.network.clone()
        }
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// List the files of the repository (or submodule) checked out at `dir`,
    /// restricted to `dir`.
    fn list_entries<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Vec<ScanEntry>>> {
        Box::pin(async move {
            let ignore_arg = (!self.ignore_file.is_empty())
                .then(|| format!("--exclude-per-directory={}", self.ignore_file));
            let garden_arg = self
                .garden_dir
                .file_name()
                .map(|name| format!("--exclude={}", name.to_string_lossy()));

            let mut args = vec!["ls-files", "-z", "-s", "--cached", "--others"];
            args.extend(ignore_arg.as_deref());
            args.extend(garden_arg.as_deref());
            let listing = self.git.run_z(dir, &args).await?;

            let ignored_tracked: HashSet<String> = match ignore_arg.as_deref() {
                Some(arg) => self
                    .git
                    .run_z(dir, &["ls-files", "-z", "--cached", "--ignored", arg])
                    .await?
                    .into_iter()
                    .collect(),
                None => HashSet::new(),
            };
            // Wholly ignored directories are listed once, with a trailing '/'.
            let gitignored = self
                .git
                .run_z(
                    dir,
                    &[
                        "ls-files",
                        "-z",
                        "--others",
                        "--ignored",
                        "--exclude-standard",
                        "--directory",
                    ],
                )
                .await?;
            let (gitignored_dirs, gitignored_files): (Vec<String>, Vec<String>) =
                gitignored.into_iter().partition(|p| p.ends_with('/'));
            let gitignored_files: HashSet<String> = gitignored_files.into_iter().collect();
            let is_gitignored = |path: &str| {
                gitignored_files.contains(path)
                    || gitignored_dirs.iter().any(|d| path.starts_with(d.as_str()))
            };
            let modified: HashSet<String> = self
                .git
                .run_z(dir, &["ls-files", "-z", "-m"])
                .await?
                .into_iter()
                .collect();

            let records: Vec<LsFilesRecord<'_>> = listing.iter().map(|r| parse_record(r)).collect();
            let mut seen = HashSet::new();
            let mut entries = Vec::with_capacity(records.len());

            // Index entries first, so a path in the index is never taken as untracked.
            for record in &records {
                let LsFilesRecord::Tracked {
                    path,
                    mode,
                    hash,
                    stage,
                } = *record
                else {
                    continue;
                };

                // Unmerged paths are listed once per conflict stage.
                if !seen.insert(path) {
                    continue;
                }
                if ignored_tracked.contains(path) {
                    debug!(path = %path, "Skipping tracked file matched by ignore file");
                    continue;
                }

                let abs = dir.join(path);
                if mode == GITLINK_MODE {
                    entries.extend(self.scan_submodule(&abs).await?);
                    continue;
                }

                let current = stage == "0" && !modified.contains(path);
                entries.push(ScanEntry {
                    path: abs,
                    hash: current.then(|| hash.to_string()),
                });
            }

            for record in &records {
                let LsFilesRecord::Untracked(path) = *record else {
                    continue;
                };
                // Nested repositories that are not registered submodules end in '/'.
                if path.ends_with('/') || is_gitignored(path) || !seen.insert(path) {
                    continue;
                }
                entries.push(ScanEntry {
                    path: dir.join(path),
                    hash: None,
                });
            }

            Ok(entries)
        })
    }

    async fn scan_submodule(&self, path: &Path) -> Result<Vec<ScanEntry>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                debug!(path = %path.display(), "Skipping submodule with missing mount path");
                return Ok(Vec::new());
            }
        }

        if tokio::fs::symlink_metadata(path.join(".git")).await.is_err() {
            debug!(path = %path.display(), "Skipping uninitialized submodule");
            return Ok(Vec::new());
        }

        match self.list_entries(path).await {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to scan submodule, skipping");
                Ok(Vec::new())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Remote sources
    // ------------------------------------------------------------------------

    async fn clone_source(
        &self,
        path: &Path,
        url: &ParsedGitUrl,
        fail_on_prompt: bool,
    ) -> Result<()> {
        let exec = self.network_exec(fail_on_prompt);

        tokio::fs::create_dir_all(path).await?;
        self.git.run(path, &["init"]).await?;
        self.git
            .run(path, &["remote", "add", "origin", &url.repository_url])
            .await?;

        let target = self.fetch_ref(&exec, path, url).await?;
        self.git.run(path, &["reset", "--hard", &target]).await?;

        exec.run(path, &["submodule", "update", "--init", "--recursive"])
            .await
            .map_err(|e| remote_error(e, url))?;
        Ok(())
    }

    /// Fetch `url.hash` from origin. Returns the revision to check out.
    async fn fetch_ref(
        &self,
        exec: &GitExecutor,
        path: &Path,
        url: &ParsedGitUrl,
    ) -> Result<String> {
        match exec
            .run(path, &["fetch", "--depth=1", "origin", &url.hash])
            .await
        {
            Ok(_) => Ok("FETCH_HEAD".to_string()),
            Err(e) if is_commit_like(&url.hash) && !is_auth_failure(&e.to_string()) => {
                // Some servers refuse to serve a commit by id; fall back to full history.
                debug!(
                    commit = %url.hash,
                    error = %e,
                    "Shallow fetch of commit failed, fetching full history"
                );
                exec.run(path, &["fetch", "--tags", "origin"])
                    .await
                    .map_err(|e| remote_error(e, url))?;
                Ok(url.hash.clone())
            }
            Err(e) => Err(remote_error(e, url)),
        }
    }
}

#[async_trait]
impl VcsHandler for GitHandler {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn get_repo_root(&self, path: &Path) -> Result<PathBuf> {
        match self.git.run(path, &["rev-parse", "--show-toplevel"]).await {
            Ok(stdout) => Ok(PathBuf::from(stdout.trim())),
            Err(e) if is_not_a_repository(&e.to_string()) => Err(GardenError::Runtime(format!(
                "Path {} is not in a git repository. Garden must be run from within a git \
                 repository. Please run `git init` if you're starting a new project and \
                 repository, or move the project to an existing repository, and try again.",
                path.display()
            ))),
            Err(e) => Err(e),
        }
    }

    async fn get_path_info(&self, path: &Path) -> Result<PathInfo> {
        let branch = self
            .git_or_empty(path, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await;
        let commit_hash = self.git_or_empty(path, &["rev-parse", "HEAD"]).await;
        let origin_url = self
            .git_or_empty(path, &["config", "--get", "remote.origin.url"])
            .await;

        Ok(PathInfo {
            branch,
            commit_hash,
            origin_url,
        })
    }

    async fn get_files(&self, params: &GetFilesParams) -> Result<Vec<VcsFile>> {
        let root = match tokio::fs::metadata(&params.path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::canonicalize(&params.path).await?,
            Ok(_) => {
                debug!(
                    path = %params.path.display(),
                    "Scan path is not a directory, returning no files"
                );
                return Ok(Vec::new());
            }
            Err(_) => {
                debug!(
                    path = %params.path.display(),
                    "Scan path does not exist, returning no files"
                );
                return Ok(Vec::new());
            }
        };

        let filter = PathFilter::new(params.include.as_deref(), params.exclude.as_deref())?;

        let entries = match self.list_entries(&root).await {
            Ok(entries) => entries,
            Err(e) if is_not_a_repository(&e.to_string()) => {
                debug!(
                    path = %root.display(),
                    "Scan path is not in a git repository, returning no files"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut candidates = Vec::with_capacity(entries.len());
        for entry in entries {
            if !filter.matches_path(&root, &entry.path) {
                continue;
            }

            let meta = match tokio::fs::symlink_metadata(&entry.path).await {
                Ok(meta) => meta,
                Err(_) => {
                    debug!(path = %entry.path.display(), "Skipping deleted file");
                    continue;
                }
            };

            if meta.file_type().is_symlink() {
                if !symlink_within(&root, &entry.path).await {
                    debug!(
                        path = %entry.path.display(),
                        "Skipping symlink pointing outside the scan path"
                    );
                    continue;
                }
            } else if meta.is_dir() {
                continue;
            }

            candidates.push(entry);
        }

        let hashed: Vec<Option<VcsFile>> = stream::iter(candidates)
            .map(|entry| async move {
                let hash = match entry.hash {
                    Some(hash) => hash,
                    None => match hash::hash_object(&entry.path).await {
                        Ok(hash) => hash,
                        Err(GardenError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                            return Ok(None);
                        }
                        Err(e) => return Err(e),
                    },
                };
                Ok(Some(VcsFile {
                    path: entry.path,
                    hash,
                }))
            })
            .buffer_unordered(self.hash_concurrency)
            .try_collect()
            .await?;

        let mut files: Vec<VcsFile> = hashed.into_iter().flatten().collect();
        files.sort();

        debug!(path = %root.display(), count = files.len(), "Listed files");
        Ok(files)
    }

    async fn hash_object(&self, path: &Path) -> Result<String> {
        hash::hash_object(path).await
    }

    async fn ensure_remote_source(&self, params: &RemoteSourceParams) -> Result<PathBuf> {
        if let Some(linked) = self.linked_path(&params.name, params.source_type) {
            debug!(source = %params.name, path = %linked.display(), "Using linked source");
            return Ok(linked);
        }

        let url = parse_git_url(&params.url)?;
        let path = self.remote_source_path(&params.name, &params.url, params.source_type);

        let slot = self.slot_lock(&path);
        let _guard = slot.lock().await;

        if tokio::fs::metadata(&path).await.is_ok() {
            debug!(source = %params.name, path = %path.display(), "Remote source already fetched");
            return Ok(path);
        }

        info!(
            source = %params.name,
            source_type = %params.source_type,
            url = %params.url,
            "Fetching remote source"
        );

        if let Err(e) = self.clone_source(&path, &url, params.fail_on_prompt).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %cleanup, "Failed to remove partial clone");
            }
            return Err(e);
        }

        Ok(path)
    }

    async fn update_remote_source(&self, params: &RemoteSourceParams) -> Result<()> {
        if self.linked_path(&params.name, params.source_type).is_some() {
            info!(source = %params.name, "Remote source is linked, skipping update");
            return Ok(());
        }

        let path = self.ensure_remote_source(params).await?;
        let url = parse_git_url(&params.url)?;
        let exec = self.network_exec(params.fail_on_prompt);

        let slot = self.slot_lock(&path);
        let _guard = slot.lock().await;

        let remote_refs = exec
            .run(&path, &["ls-remote", &url.repository_url, &url.hash])
            .await
            .map_err(|e| remote_error(e, &url))?;
        let lines: Vec<&str> = remote_refs.lines().collect();
        let remote_commit = get_commit_id_from_ref_list(&lines);
        let local_commit = self.git_or_empty(&path, &["rev-parse", "HEAD"]).await;

        if remote_commit.as_deref() == Some(local_commit.as_str()) {
            debug!(
                source = %params.name,
                commit = %local_commit,
                "Remote source already up to date"
            );
        } else {
            info!(source = %params.name, url = %params.url, "Updating remote source");
            let target = self.fetch_ref(&exec, &path, &url).await?;
            self.git.run(&path, &["reset", "--hard", &target]).await?;
        }

        exec.run(&path, &["submodule", "update", "--init", "--recursive", "--remote"])
            .await
            .map_err(|e| remote_error(e, &url))?;

        info!(source = %params.name, "Remote source updated");
        Ok(())
    }
}

impl GitHandler {
    async fn git_or_empty(&self, path: &Path, args: &[&str]) -> String {
        self.git
            .run(path, args)
            .await
            .map(|stdout| stdout.trim().to_string())
            .unwrap_or_default()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Whether the symlink at `link` points inside `root`.
///
/// Relative targets are resolved lexically against the link's directory;
/// absolute targets are canonicalized when they exist.
async fn symlink_within(root: &Path, link: &Path) -> bool {
    let target = match tokio::fs::read_link(link).await {
        Ok(target) => target,
        Err(_) => return false,
    };

    let resolved = if target.is_absolute() {
        match tokio::fs::canonicalize(&target).await {
            Ok(path) => path,
            Err(_) => normalize_lexically(&target),
        }
    } else {
        let parent = link.parent().unwrap_or(root);
        normalize_lexically(&parent.join(&target))
    };

    resolved.starts_with(root)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_commit_like(rev: &str) -> bool {
    (7..=40).contains(&rev.len()) && rev.chars().all(|c| c.is_ascii_hexdigit())
}

/// Give authentication failures against a remote actionable advice.
fn remote_error(err: GardenError, url: &ParsedGitUrl) -> GardenError {
    let message = err.to_string();
    if is_auth_failure(&message) {
        GardenError::Runtime(format!(
            "Could not access remote repository {}. Make sure the repository exists and that \
             you have access to it, with git credentials (an SSH key or a credential helper) \
             configured for its host.\n\n{}",
            url.repository_url, message
        ))
    } else {
        err
    }
}

// ============================================================================
// Tests
// ============================================================================
