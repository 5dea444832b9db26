//! Include/exclude filtering of scanned paths.
//!
//! Patterns are globs matched against `/`-separated paths relative to the
//! scanned directory. `*` stops at directory separators and `**` crosses
//! them. A pattern that names a directory outright also matches everything
//! below it, and a leading `./` is ignored.

use std::path::{Component, Path};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::Result;

/// One side (include or exclude) of a filter.
#[derive(Debug, Clone)]
struct PatternSet {
    globs: GlobSet,
    /// Normalized patterns, used to match whole directories by name.
    prefixes: Vec<String>,
}

impl PatternSet {
    fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut prefixes = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let normalized = normalize_pattern(pattern);
            if normalized.is_empty() {
                continue;
            }
            builder.add(
                GlobBuilder::new(&normalized)
                    .literal_separator(true)
                    .build()?,
            );
            prefixes.push(normalized);
        }

        Ok(Self {
            globs: builder.build()?,
            prefixes,
        })
    }

    fn is_match(&self, rel_path: &str) -> bool {
        self.globs.is_match(rel_path)
            || self.prefixes.iter().any(|prefix| {
                rel_path.len() > prefix.len()
                    && rel_path.starts_with(prefix.as_str())
                    && rel_path.as_bytes()[prefix.len()] == b'/'
            })
    }
}

/// Include/exclude filter for scanned files.
///
/// No include list means everything is included; an *empty* include list
/// means nothing is. A path must be included and not excluded.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Option<PatternSet>,
    exclude: Option<PatternSet>,
}

impl PathFilter {
    pub fn new(include: Option<&[String]>, exclude: Option<&[String]>) -> Result<Self> {
        Ok(Self {
            include: include.map(PatternSet::new).transpose()?,
            exclude: exclude.map(PatternSet::new).transpose()?,
        })
    }

    /// Check a `/`-separated path relative to the scan root.
    pub fn matches(&self, rel_path: &str) -> bool {
        let included = self
            .include
            .as_ref()
            .map(|set| set.is_match(rel_path))
            .unwrap_or(true);
        let excluded = self
            .exclude
            .as_ref()
            .map(|set| set.is_match(rel_path))
            .unwrap_or(false);
        included && !excluded
    }

    /// Check `path` against the filter, relative to `root`.
    ///
    /// Paths outside `root` never match.
    pub fn matches_path(&self, root: &Path, path: &Path) -> bool {
        match path.strip_prefix(root) {
            Ok(rel) => self.matches(&to_slash(rel)),
            Err(_) => false,
        }
    }
}

fn normalize_pattern(pattern: &str) -> String {
    let mut p = pattern.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/').to_string()
}

/// Render a relative path with `/` separators.
pub fn to_slash(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
