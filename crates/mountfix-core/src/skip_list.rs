// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Paths excluded from overlay application.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

/// Canonicalized exclusion list.
///
/// A mount is excluded when its path equals an entry or lies underneath one.
/// Matching is component-wise, so `/w/app` does not exclude `/w/app-data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkipList {
    entries: Vec<PathBuf>,
}

impl SkipList {
    /// Parses a comma-separated list. Blank items are ignored and relative
    /// items are resolved against `workspace_root`.
    pub fn parse(raw: &str, workspace_root: &Path) -> Self {
        let mut entries: Vec<PathBuf> = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let candidate = Path::new(item);
            let absolute = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                workspace_root.join(candidate)
            };
            let normalized = normalize_path(&absolute);
            if !entries.contains(&normalized) {
                entries.push(normalized);
            }
        }
        Self { entries }
    }

    pub fn from_entries<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            entries: entries.into_iter().map(|p| normalize_path(p.as_ref())).collect(),
        }
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry that excludes `path`, if any.
    pub fn matching_entry(&self, path: &Path) -> Option<&Path> {
        let path = normalize_path(path);
        self.entries.iter().find(|entry| path.starts_with(entry)).map(PathBuf::as_path)
    }

    pub fn excludes(&self, path: &Path) -> bool {
        self.matching_entry(path).is_some()
    }
}

/// Canonicalizes an existing path; falls back to lexical normalization
/// (dropping `.`, resolving `..`, trailing slashes) for paths that do not
/// exist on this host.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }

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
    if out.as_os_str().is_empty() {
        out.push(Component::RootDir.as_os_str());
    }
    out
}
