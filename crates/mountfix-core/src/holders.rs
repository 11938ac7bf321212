// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Which processes hold a file open.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Error, Result};

/// Live query of the processes holding a path open.
///
/// `Err` means the answer is unknown; callers must not treat it as "no
/// holders".
pub trait HolderQuery {
    fn holders(&self, path: &Path) -> Result<BTreeSet<u32>>;
}

impl<H: HolderQuery + ?Sized> HolderQuery for &H {
    fn holders(&self, path: &Path) -> Result<BTreeSet<u32>> {
        (**self).holders(path)
    }
}

/// Scans `/proc/<pid>/fd/*`, matching descriptors by device and inode.
///
/// Link text is not enough: after a deferred delete the holder's descriptor
/// still names the file it opened, now suffixed with ` (deleted)`, while the
/// inode lives on under `.fuse_hidden*`. Stat follows the magic link to the
/// open inode, as lsof and fuser do.
///
/// A process that exits mid-scan is ignored. A process whose descriptors
/// cannot be read makes the whole scan incomplete.
#[derive(Debug, Clone)]
pub struct ProcFdHolders {
    proc_root: PathBuf,
}

impl ProcFdHolders {
    pub fn new() -> Self {
        Self::at("/proc")
    }

    pub fn at(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl Default for ProcFdHolders {
    fn default() -> Self {
        Self::new()
    }
}

/// `(st_dev, st_ino)` of whatever `path` resolves to.
#[cfg(unix)]
fn file_id(path: &Path) -> io::Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_path: &Path) -> io::Result<(u64, u64)> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no /proc on this platform"))
}

impl HolderQuery for ProcFdHolders {
    fn holders(&self, path: &Path) -> Result<BTreeSet<u32>> {
        let incomplete = |reason: String| Error::HolderScanIncomplete {
            path: path.to_path_buf(),
            reason,
        };

        let wanted = file_id(path).map_err(|e| incomplete(format!("{}: {e}", path.display())))?;

        let mut pids = BTreeSet::new();
        let procs = std::fs::read_dir(&self.proc_root)
            .map_err(|e| incomplete(format!("{}: {e}", self.proc_root.display())))?;

        for entry in procs {
            let entry = entry.map_err(|e| incomplete(e.to_string()))?;
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };

            let fd_dir = entry.path().join("fd");
            let fds = match std::fs::read_dir(&fd_dir) {
                Ok(fds) => fds,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(incomplete(format!("{}: {e}", fd_dir.display()))),
            };

            for fd in fds {
                let fd = match fd {
                    Ok(fd) => fd,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                    Err(e) => return Err(incomplete(format!("{}: {e}", fd_dir.display()))),
                };
                let id = match file_id(&fd.path()) {
                    Ok(id) => id,
                    // fd closed between listing and stat
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(incomplete(format!("{}: {e}", fd.path().display()))),
                };
                if id == wanted {
                    trace!(pid, path = %path.display(), "found holder");
                    pids.insert(pid);
                    break;
                }
            }
        }

        Ok(pids)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn fake_proc(root: &Path, pid: &str, links: &[&Path]) {
        let fd_dir = root.join(pid).join("fd");
        std::fs::create_dir_all(&fd_dir).unwrap();
        for (n, target) in links.iter().enumerate() {
            symlink(target, fd_dir.join(n.to_string())).unwrap();
        }
    }

    /// A proc root listing only this process, backed by the real `/proc`.
    fn own_proc(root: &Path) {
        let pid = std::process::id().to_string();
        symlink(Path::new("/proc").join(&pid), root.join(pid)).unwrap();
    }

    #[test]
    fn reports_every_pid_holding_the_path() {
        let files = tempfile::tempdir().unwrap();
        let artifact = files.path().join(".fuse_hidden0002");
        let other = files.path().join("other");
        std::fs::write(&artifact, "").unwrap();
        std::fs::write(&other, "").unwrap();

        let proc_root = tempfile::tempdir().unwrap();
        fake_proc(proc_root.path(), "4821", &[Path::new("/dev/null"), &artifact]);
        fake_proc(proc_root.path(), "77", &[&artifact, &artifact]);
        fake_proc(proc_root.path(), "90", &[&other]);
        std::fs::create_dir_all(proc_root.path().join("self")).unwrap();

        let holders = ProcFdHolders::at(proc_root.path()).holders(&artifact).unwrap();
        assert_eq!(holders.into_iter().collect::<Vec<_>>(), vec![77, 4821]);
    }

    #[test]
    fn hard_link_to_the_same_inode_counts_as_held() {
        let files = tempfile::tempdir().unwrap();
        let original = files.path().join("notes.txt");
        let artifact = files.path().join(".fuse_hidden0003");
        std::fs::write(&original, "").unwrap();
        std::fs::hard_link(&original, &artifact).unwrap();

        let proc_root = tempfile::tempdir().unwrap();
        fake_proc(proc_root.path(), "12", &[&original]);
        let holders = ProcFdHolders::at(proc_root.path()).holders(&artifact).unwrap();
        assert!(holders.contains(&12));
    }

    #[test]
    fn open_file_renamed_to_artifact_after_unlink_is_held() {
        let files = tempfile::tempdir().unwrap();
        let original = files.path().join("foo.txt");
        let artifact = files.path().join(".fuse_hidden0001");
        let _open = std::fs::File::create(&original).unwrap();
        std::fs::hard_link(&original, &artifact).unwrap();
        std::fs::remove_file(&original).unwrap();

        let proc_root = tempfile::tempdir().unwrap();
        own_proc(proc_root.path());
        let holders = ProcFdHolders::at(proc_root.path()).holders(&artifact).unwrap();
        assert!(holders.contains(&std::process::id()));
    }

    #[test]
    fn dangling_descriptor_links_are_skipped() {
        let files = tempfile::tempdir().unwrap();
        let artifact = files.path().join(".fuse_hidden0004");
        std::fs::write(&artifact, "").unwrap();

        let proc_root = tempfile::tempdir().unwrap();
        fake_proc(proc_root.path(), "8", &[Path::new("/mountfix-gone/file")]);
        let holders = ProcFdHolders::at(proc_root.path()).holders(&artifact).unwrap();
        assert!(holders.is_empty());
    }

    #[test]
    fn unheld_path_has_empty_set() {
        let files = tempfile::tempdir().unwrap();
        let artifact = files.path().join(".fuse_hidden0001");
        std::fs::write(&artifact, "").unwrap();

        let proc_root = tempfile::tempdir().unwrap();
        fake_proc(proc_root.path(), "1", &[Path::new("/dev/null")]);
        let holders = ProcFdHolders::at(proc_root.path()).holders(&artifact).unwrap();
        assert!(holders.is_empty());
    }

    #[test]
    fn process_without_fd_dir_is_ignored() {
        let files = tempfile::tempdir().unwrap();
        let artifact = files.path().join("x");
        std::fs::write(&artifact, "").unwrap();

        let proc_root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(proc_root.path().join("55")).unwrap();
        let holders = ProcFdHolders::at(proc_root.path()).holders(&artifact).unwrap();
        assert!(holders.is_empty());
    }

    #[test]
    fn missing_proc_root_is_incomplete() {
        let files = tempfile::tempdir().unwrap();
        let artifact = files.path().join("x");
        std::fs::write(&artifact, "").unwrap();

        let err = ProcFdHolders::at("/mountfix-no-such-proc")
            .holders(&artifact)
            .unwrap_err();
        assert!(matches!(err, Error::HolderScanIncomplete { .. }));
    }

    #[test]
    fn vanished_artifact_is_incomplete() {
        let err = ProcFdHolders::new()
            .holders(Path::new("/mountfix-no-such-dir/.fuse_hidden0001"))
            .unwrap_err();
        assert!(matches!(err, Error::HolderScanIncomplete { .. }));
    }

    #[test]
    fn own_open_file_is_found_in_real_proc() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::fs::canonicalize(dir.path()).unwrap().join(".fuse_hidden0009");
        let _held = std::fs::File::create(&path).unwrap();

        // Unprivileged runs may be unable to read other users' fds; that
        // must surface as an error, never as an empty set.
        match ProcFdHolders::new().holders(&path) {
            Ok(holders) => assert!(holders.contains(&std::process::id())),
            Err(err) => assert!(matches!(err, Error::HolderScanIncomplete { .. })),
        }
    }
}
