// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Empirical permission probe for filesystems the classifier does not know.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

/// Mode set on the probe file. Must differ from any plausible creation mode.
pub const PROBE_MODE: u32 = 0o741;
/// Used instead when the file happens to be created with `PROBE_MODE`.
pub const PROBE_MODE_ALT: u32 = 0o614;

const PROBE_PREFIX: &str = ".mountfix-probe-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeOutcome {
    /// Permission bits survived the round-trip.
    Faithful,
    /// The filesystem reported something other than what was set.
    Unfaithful,
    /// The probe could not run (read-only mount, I/O error).
    Inconclusive,
}

impl ProbeOutcome {
    /// Inconclusive is treated like unfaithful: over-applying the overlay is
    /// the safe side.
    pub fn needs_overlay(self) -> bool {
        !matches!(self, ProbeOutcome::Faithful)
    }
}

/// The file operations a probe performs.
pub trait PermissionFs {
    /// Creates a uniquely named file inside `dir` and returns its path.
    fn create_probe(&self, dir: &Path) -> io::Result<PathBuf>;
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;
    /// Permission bits (`0o7777` mask) as reported by stat.
    fn mode(&self, path: &Path) -> io::Result<u32>;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

#[cfg(unix)]
impl PermissionFs for HostFs {
    fn create_probe(&self, dir: &Path) -> io::Result<PathBuf> {
        let file = tempfile::Builder::new().prefix(PROBE_PREFIX).tempfile_in(dir)?;
        // Removal is owned by the probe's scope guard from here on.
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }

    fn mode(&self, path: &Path) -> io::Result<u32> {
        use std::os::unix::fs::PermissionsExt;
        Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Writes a probe file into `mount`, changes its mode, and checks that stat
/// reports the new mode. The probe file is removed on every exit path.
pub fn probe<F: PermissionFs>(fs: &F, mount: &Path) -> ProbeOutcome {
    let path = match fs.create_probe(mount) {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, operation = "probe_permissions", mount = %mount.display(), "could not create probe file; treating mount as unfaithful");
            return ProbeOutcome::Inconclusive;
        }
    };

    let path = scopeguard::guard(path, |path| {
        if let Err(err) = fs.remove(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, operation = "probe_cleanup", path = %path.display(), "failed to remove probe file");
            }
        }
    });

    let outcome = match round_trip(fs, &path) {
        Ok(true) => ProbeOutcome::Faithful,
        Ok(false) => ProbeOutcome::Unfaithful,
        Err(err) => {
            warn!(error = %err, operation = "probe_permissions", mount = %mount.display(), "probe failed; treating mount as unfaithful");
            ProbeOutcome::Inconclusive
        }
    };

    debug!(operation = "probe_permissions", mount = %mount.display(), outcome = ?outcome, "probe finished");
    outcome
}

fn round_trip<F: PermissionFs>(fs: &F, path: &Path) -> io::Result<bool> {
    let initial = fs.mode(path)?;
    let target = if initial == PROBE_MODE {
        PROBE_MODE_ALT
    } else {
        PROBE_MODE
    };
    fs.set_mode(path, target)?;
    let observed = fs.mode(path)?;
    Ok(observed == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// Synthetic filesystem; `keeps_mode == false` accepts chmod but keeps
    /// reporting the creation mode.
    struct SyntheticFs {
        keeps_mode: bool,
        fail_create: bool,
        fail_stat_after_chmod: bool,
        files: RefCell<HashMap<PathBuf, u32>>,
        created: Cell<u32>,
        removed: Cell<u32>,
        chmodded: Cell<bool>,
    }

    impl SyntheticFs {
        fn new(keeps_mode: bool) -> Self {
            Self {
                keeps_mode,
                fail_create: false,
                fail_stat_after_chmod: false,
                files: RefCell::new(HashMap::new()),
                created: Cell::new(0),
                removed: Cell::new(0),
                chmodded: Cell::new(false),
            }
        }
    }

    impl PermissionFs for SyntheticFs {
        fn create_probe(&self, dir: &Path) -> io::Result<PathBuf> {
            if self.fail_create {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            let path = dir.join(format!("{PROBE_PREFIX}{}", self.created.get()));
            self.created.set(self.created.get() + 1);
            self.files.borrow_mut().insert(path.clone(), 0o644);
            Ok(path)
        }

        fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
            self.chmodded.set(true);
            if self.keeps_mode {
                self.files.borrow_mut().insert(path.to_path_buf(), mode);
            }
            Ok(())
        }

        fn mode(&self, path: &Path) -> io::Result<u32> {
            if self.fail_stat_after_chmod && self.chmodded.get() {
                return Err(io::Error::other("stat failed"));
            }
            self.files
                .borrow()
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn remove(&self, path: &Path) -> io::Result<()> {
            self.removed.set(self.removed.get() + 1);
            self.files
                .borrow_mut()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    #[test]
    fn mode_that_sticks_is_faithful() {
        let fs = SyntheticFs::new(true);
        assert_eq!(probe(&fs, Path::new("/w")), ProbeOutcome::Faithful);
        assert!(fs.files.borrow().is_empty());
    }

    #[test]
    fn dropped_chmod_is_unfaithful() {
        let fs = SyntheticFs::new(false);
        assert_eq!(probe(&fs, Path::new("/w")), ProbeOutcome::Unfaithful);
        assert!(fs.files.borrow().is_empty());
        assert_eq!(fs.removed.get(), 1);
    }

    #[test]
    fn create_failure_is_inconclusive_and_needs_overlay() {
        let mut fs = SyntheticFs::new(true);
        fs.fail_create = true;
        let outcome = probe(&fs, Path::new("/w"));
        assert_eq!(outcome, ProbeOutcome::Inconclusive);
        assert!(outcome.needs_overlay());
        assert_eq!(fs.removed.get(), 0);
    }

    #[test]
    fn io_failure_mid_probe_still_removes_file() {
        let mut fs = SyntheticFs::new(true);
        fs.fail_stat_after_chmod = true;
        assert_eq!(probe(&fs, Path::new("/w")), ProbeOutcome::Inconclusive);
        assert!(fs.files.borrow().is_empty());
        assert_eq!(fs.removed.get(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn host_tempdir_is_faithful_and_left_clean() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(probe(&HostFs, dir.path()), ProbeOutcome::Faithful);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn host_missing_directory_is_inconclusive() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert_eq!(probe(&HostFs, &missing), ProbeOutcome::Inconclusive);
    }
}
