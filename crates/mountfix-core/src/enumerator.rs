// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount points under the workspace root.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::mount_table::MountTable;
use crate::skip_list::normalize_path;

/// A host-provided mount under the workspace root, rebuilt from the live
/// mount table on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub path: PathBuf,
    /// Filesystem type of the topmost mount at `path`.
    pub fstype: String,
    /// True when any layer at `path` is a FUSE filesystem. Such mounts never
    /// receive another overlay.
    pub already_fuse: bool,
}

pub fn is_fuse_fstype(fstype: &str) -> bool {
    fstype == "fuse" || fstype == "fuseblk" || fstype.starts_with("fuse.")
}

/// Lists every distinct mount at or below `root`, in mount-table order.
///
/// Rows stacked on the same target collapse into one `MountPoint`.
pub fn enumerate<T: MountTable>(table: &T, root: &Path) -> Result<Vec<MountPoint>> {
    let root = normalize_path(root);
    let mut mounts: Vec<MountPoint> = Vec::new();

    for entry in table.entries()? {
        let path = normalize_path(&entry.target);
        if !path.starts_with(&root) {
            continue;
        }
        let fuse = is_fuse_fstype(&entry.fstype);
        match mounts.iter_mut().find(|m| m.path == path) {
            Some(existing) => {
                existing.fstype = entry.fstype;
                existing.already_fuse |= fuse;
            }
            None => mounts.push(MountPoint {
                path,
                fstype: entry.fstype,
                already_fuse: fuse,
            }),
        }
    }

    debug!(
        operation = "enumerate_mounts",
        root = %root.display(),
        count = mounts.len(),
        "enumerated workspace mounts"
    );
    Ok(mounts)
}

/// FUSE-backed mounts at or below `root`.
pub fn fuse_mounts<T: MountTable>(table: &T, root: &Path) -> Result<Vec<MountPoint>> {
    Ok(enumerate(table, root)?.into_iter().filter(|m| m.already_fuse).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount_table::MountEntry;

    struct Fixed(Vec<MountEntry>);

    impl MountTable for Fixed {
        fn entries(&self) -> Result<Vec<MountEntry>> {
            Ok(self.0.clone())
        }
    }

    const ROOT: &str = "/mountfix-test-root/workspaces";

    fn at(rel: &str, fstype: &str) -> MountEntry {
        MountEntry::new(format!("{ROOT}{rel}"), fstype)
    }

    #[test]
    fn only_mounts_under_root_are_returned() {
        let table = Fixed(vec![
            MountEntry::new("/", "overlay"),
            MountEntry::new("/mountfix-test-root/workspaces-other", "virtiofs"),
            at("", "virtiofs"),
            at("/app", "virtiofs"),
        ]);
        let mounts = enumerate(&table, Path::new(ROOT)).unwrap();
        let paths: Vec<_> = mounts.iter().map(|m| m.path.clone()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from(ROOT), PathBuf::from(format!("{ROOT}/app"))]
        );
    }

    #[test]
    fn stacked_rows_collapse_and_report_fuse() {
        let table = Fixed(vec![at("/app", "virtiofs"), at("/app/", "fuse.bindfs")]);
        let mounts = enumerate(&table, Path::new(ROOT)).unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].already_fuse);
        assert_eq!(mounts[0].fstype, "fuse.bindfs");
    }

    #[test]
    fn empty_table_is_nothing_to_do() {
        assert!(enumerate(&Fixed(Vec::new()), Path::new(ROOT)).unwrap().is_empty());
    }

    #[test]
    fn fuse_type_detection() {
        assert!(is_fuse_fstype("fuse"));
        assert!(is_fuse_fstype("fuse.bindfs"));
        assert!(is_fuse_fstype("fuseblk"));
        assert!(!is_fuse_fstype("fusectl"));
        assert!(!is_fuse_fstype("virtiofs"));
    }

    #[test]
    fn fuse_mounts_filters_non_fuse() {
        let table = Fixed(vec![at("/a", "ext4"), at("/b", "fuse.grpcfuse")]);
        let mounts = fuse_mounts(&table, Path::new(ROOT)).unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].path.ends_with("b"));
    }
}
