// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![cfg(unix)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use mountfix_core::holders::{HolderQuery, ProcFdHolders};
use mountfix_core::mount_table::{MountEntry, MountTable};
use mountfix_core::reaper::{ReapAction, ReapTrigger, Reaper};
use mountfix_core::syslog::SystemLog;
use mountfix_core::{Error, Result};

struct FixedTable(Vec<MountEntry>);

impl MountTable for FixedTable {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        Ok(self.0.clone())
    }
}

/// Holders keyed by path; paths in `broken` fail the lookup.
#[derive(Default)]
struct FakeHolders {
    held: RefCell<BTreeMap<PathBuf, BTreeSet<u32>>>,
    broken: RefCell<BTreeSet<PathBuf>>,
}

impl FakeHolders {
    fn hold(&self, path: &Path, pid: u32) {
        self.held.borrow_mut().entry(path.to_path_buf()).or_default().insert(pid);
    }

    fn release(&self, path: &Path) {
        self.held.borrow_mut().remove(path);
    }
}

impl HolderQuery for FakeHolders {
    fn holders(&self, path: &Path) -> Result<BTreeSet<u32>> {
        if self.broken.borrow().contains(path) {
            return Err(Error::HolderScanIncomplete {
                path: path.to_path_buf(),
                reason: "permission denied".to_string(),
            });
        }
        Ok(self.held.borrow().get(path).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct RecordingLog {
    lines: RefCell<Vec<String>>,
}

impl SystemLog for RecordingLog {
    fn record(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    app: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap().join("workspaces");
        let app = root.join("app");
        std::fs::create_dir_all(app.join("target")).unwrap();
        Self {
            _dir: dir,
            root,
            app,
        }
    }

    fn table(&self) -> FixedTable {
        FixedTable(vec![
            MountEntry::new(self.app.as_path(), "virtiofs"),
            MountEntry::new(self.app.as_path(), "fuse.bindfs"),
        ])
    }

    fn artifact(&self, name: &str) -> PathBuf {
        let path = self.app.join(name);
        std::fs::write(&path, "stale").unwrap();
        path
    }
}

#[test]
fn held_artifact_survives_until_released_then_is_removed_once() {
    let fx = Fixture::new();
    let free = fx.artifact(".fuse_hidden0001");
    let held = fx.artifact("target/.fuse_hidden0002");
    let keep = fx.artifact("notes.txt");

    let holders = FakeHolders::default();
    holders.hold(&held, 4821);
    let log = RecordingLog::default();
    let reaper = Reaper::new(fx.table(), &holders, &log, &fx.root, false);

    let first = reaper.run_pass(ReapTrigger::Boot);
    assert!(!free.exists());
    assert!(held.exists());
    assert!(keep.exists());
    assert_eq!(first.removed().collect::<Vec<_>>(), vec![free.as_path()]);
    assert_eq!(
        first.entries[1].action,
        ReapAction::Retained { holders: vec![4821] }
    );
    assert_eq!(
        *log.lines.borrow(),
        vec![
            format!("removed {}", free.display()),
            format!("retained {} (held by pid 4821)", held.display()),
        ]
    );

    holders.release(&held);
    let second = reaper.run_pass(ReapTrigger::Scheduled);
    assert!(!held.exists());
    assert_eq!(second.removed().collect::<Vec<_>>(), vec![held.as_path()]);

    let third = reaper.run_pass(ReapTrigger::Scheduled);
    assert!(third.entries.is_empty());

    let removals_of_held = log
        .lines
        .borrow()
        .iter()
        .filter(|l| **l == format!("removed {}", held.display()))
        .count();
    assert_eq!(removals_of_held, 1);
}

#[test]
fn disabled_reaper_deletes_nothing_and_logs_nothing() {
    let fx = Fixture::new();
    let artifact = fx.artifact(".fuse_hidden0001");
    let log = RecordingLog::default();
    let reaper = Reaper::new(fx.table(), FakeHolders::default(), &log, &fx.root, true);

    for trigger in [ReapTrigger::Boot, ReapTrigger::Scheduled] {
        let report = reaper.run_pass(trigger);
        assert!(report.disabled);
        assert!(report.entries.is_empty());
    }
    assert!(artifact.exists());
    assert!(log.lines.borrow().is_empty());
}

#[test]
fn failed_holder_check_retains_the_artifact() {
    let fx = Fixture::new();
    let artifact = fx.artifact(".fuse_hidden0007");
    let holders = FakeHolders::default();
    holders.broken.borrow_mut().insert(artifact.clone());
    let log = RecordingLog::default();
    let reaper = Reaper::new(fx.table(), &holders, &log, &fx.root, false);

    let report = reaper.run_pass(ReapTrigger::Scheduled);

    assert!(artifact.exists());
    assert!(matches!(
        report.entries[0].action,
        ReapAction::HolderCheckFailed { .. }
    ));
    let lines = log.lines.borrow();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with(&format!("retained {} (holder check failed:", artifact.display())));
}

#[test]
fn non_fuse_mounts_are_not_scanned() {
    let fx = Fixture::new();
    let artifact = fx.artifact(".fuse_hidden0001");
    let table = FixedTable(vec![MountEntry::new(fx.app.as_path(), "virtiofs")]);
    let log = RecordingLog::default();
    let reaper = Reaper::new(table, FakeHolders::default(), &log, &fx.root, false);

    let report = reaper.run_pass(ReapTrigger::Boot);

    assert!(report.mounts.is_empty());
    assert!(artifact.exists());
    assert!(log.lines.borrow().is_empty());
}

#[test]
fn deferred_delete_of_a_file_this_process_holds_is_retained() {
    let fx = Fixture::new();
    let original = fx.app.join("foo.txt");
    let artifact = fx.app.join(".fuse_hidden0001");
    let open = std::fs::File::create(&original).unwrap();
    std::fs::hard_link(&original, &artifact).unwrap();
    std::fs::remove_file(&original).unwrap();

    // Only this process is visible, so unrelated root-owned fds cannot make
    // the scan incomplete.
    let proc_root = tempfile::tempdir().unwrap();
    let pid = std::process::id();
    std::os::unix::fs::symlink(Path::new("/proc").join(pid.to_string()), proc_root.path().join(pid.to_string()))
        .unwrap();

    let log = RecordingLog::default();
    let reaper = Reaper::new(fx.table(), ProcFdHolders::at(proc_root.path()), &log, &fx.root, false);

    let report = reaper.run_pass(ReapTrigger::Scheduled);
    assert!(artifact.exists());
    assert_eq!(
        report.entries[0].action,
        ReapAction::Retained { holders: vec![pid] }
    );
    assert_eq!(
        *log.lines.borrow(),
        vec![format!("retained {} (held by pid {pid})", artifact.display())]
    );

    drop(open);
    let report = reaper.run_pass(ReapTrigger::Scheduled);
    assert!(!artifact.exists());
    assert_eq!(report.removed().collect::<Vec<_>>(), vec![artifact.as_path()]);
}
