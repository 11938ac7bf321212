// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Removal of FUSE deferred-delete artifacts.
//!
//! FUSE filesystems rename a file that is unlinked while still open to
//! `.fuse_hidden*` and expect it to disappear once the last handle closes.
//! Across container restarts those files leak. A pass walks every FUSE mount
//! under the workspace, asks who holds each artifact, and removes only the
//! ones nobody holds at that moment.
//!
//! The holder check and the unlink are two steps; a process opening the file
//! in between is not detected. Artifacts are transient temp files, so this
//! window is accepted.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

use crate::enumerator::fuse_mounts;
use crate::holders::HolderQuery;
use crate::mount_table::MountTable;
use crate::syslog::SystemLog;

/// File-name prefix libfuse uses for deferred deletes.
pub const ARTIFACT_PREFIX: &str = ".fuse_hidden";

/// A deferred-delete file found during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FuseArtifact {
    pub mount: PathBuf,
    pub path: PathBuf,
    /// Filled in by the holder check of the current pass.
    pub holder_pids: BTreeSet<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReaperState {
    Idle,
    Scanning,
    CheckingHolders,
    Deleting,
    Retaining,
}

impl ReaperState {
    pub fn can_transition_to(self, next: ReaperState) -> bool {
        use ReaperState::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Scanning, CheckingHolders)
                | (Scanning, Idle)
                | (CheckingHolders, Deleting)
                | (CheckingHolders, Retaining)
                | (Deleting, CheckingHolders)
                | (Retaining, CheckingHolders)
                | (Deleting, Idle)
                | (Retaining, Idle)
        )
    }
}

/// Why the pass was started; only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReapTrigger {
    Boot,
    Scheduled,
}

impl fmt::Display for ReapTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReapTrigger::Boot => write!(f, "boot"),
            ReapTrigger::Scheduled => write!(f, "scheduled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ReapAction {
    Removed,
    Retained { holders: Vec<u32> },
    HolderCheckFailed { error: String },
    RemoveFailed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapEntry {
    pub mount: PathBuf,
    pub path: PathBuf,
    #[serde(flatten)]
    pub action: ReapAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReapReport {
    pub trigger: ReapTrigger,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_table_error: Option<String>,
    pub mounts: Vec<PathBuf>,
    pub entries: Vec<ReapEntry>,
}

impl ReapReport {
    fn empty(trigger: ReapTrigger, disabled: bool) -> Self {
        Self {
            trigger,
            disabled,
            mount_table_error: None,
            mounts: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn removed(&self) -> impl Iterator<Item = &Path> {
        self.entries
            .iter()
            .filter(|e| e.action == ReapAction::Removed)
            .map(|e| e.path.as_path())
    }

    pub fn retained(&self) -> impl Iterator<Item = &Path> {
        self.entries
            .iter()
            .filter(|e| e.action != ReapAction::Removed)
            .map(|e| e.path.as_path())
    }
}

pub struct Reaper<T, H, L> {
    table: T,
    holders: H,
    log: L,
    root: PathBuf,
    disabled: bool,
}

impl<T: MountTable, H: HolderQuery, L: SystemLog> Reaper<T, H, L> {
    pub fn new(table: T, holders: H, log: L, root: impl Into<PathBuf>, disabled: bool) -> Self {
        Self {
            table,
            holders,
            log,
            root: root.into(),
            disabled,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// One complete pass. Mounts and holders are re-queried every time.
    pub fn run_pass(&self, trigger: ReapTrigger) -> ReapReport {
        if self.disabled {
            debug!(operation = "reap", trigger = %trigger, "reaper disabled; skipping pass");
            return ReapReport::empty(trigger, true);
        }

        let mut report = ReapReport::empty(trigger, false);
        let mut state = ReaperState::Idle;
        advance(&mut state, ReaperState::Scanning);

        let mounts = match fuse_mounts(&self.table, &self.root) {
            Ok(mounts) => mounts,
            Err(err) => {
                warn!(error = %err, operation = "reap", trigger = %trigger, "could not read the mount table; skipping pass");
                report.mount_table_error = Some(err.to_string());
                advance(&mut state, ReaperState::Idle);
                return report;
            }
        };
        report.mounts = mounts.iter().map(|m| m.path.clone()).collect();

        let candidates = scan_artifacts(mounts.iter().map(|m| m.path.as_path()));
        debug!(
            operation = "reap",
            trigger = %trigger,
            mounts = report.mounts.len(),
            candidates = candidates.len(),
            "scan finished"
        );

        for mut artifact in candidates {
            advance(&mut state, ReaperState::CheckingHolders);
            let action = match self.holders.holders(&artifact.path) {
                Ok(pids) if pids.is_empty() => {
                    advance(&mut state, ReaperState::Deleting);
                    self.remove(&artifact.path)
                }
                Ok(pids) => {
                    advance(&mut state, ReaperState::Retaining);
                    artifact.holder_pids = pids;
                    self.retain_held(&artifact)
                }
                Err(err) => {
                    advance(&mut state, ReaperState::Retaining);
                    let line = format!(
                        "retained {} (holder check failed: {err})",
                        artifact.path.display()
                    );
                    warn!(operation = "reap", path = %artifact.path.display(), error = %err, "holder check failed; keeping artifact");
                    self.log.record(&line);
                    ReapAction::HolderCheckFailed {
                        error: err.to_string(),
                    }
                }
            };
            report.entries.push(ReapEntry {
                mount: artifact.mount,
                path: artifact.path,
                action,
            });
        }

        advance(&mut state, ReaperState::Idle);
        info!(
            operation = "reap",
            trigger = %trigger,
            removed = report.removed().count(),
            retained = report.retained().count(),
            "reaper pass finished"
        );
        report
    }

    fn remove(&self, path: &Path) -> ReapAction {
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(operation = "reap", path = %path.display(), "removed unheld FUSE artifact");
                self.log.record(&format!("removed {}", path.display()));
                ReapAction::Removed
            }
            Err(err) => {
                warn!(operation = "reap", path = %path.display(), error = %err, "failed to remove FUSE artifact");
                self.log
                    .record(&format!("failed to remove {}: {err}", path.display()));
                ReapAction::RemoveFailed {
                    error: err.to_string(),
                }
            }
        }
    }

    fn retain_held(&self, artifact: &FuseArtifact) -> ReapAction {
        let holders: Vec<u32> = artifact.holder_pids.iter().copied().collect();
        let pid_list = holders.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
        info!(operation = "reap", path = %artifact.path.display(), holders = %pid_list, "artifact still open; keeping it");
        self.log.record(&format!(
            "retained {} (held by pid {pid_list})",
            artifact.path.display()
        ));
        ReapAction::Retained { holders }
    }
}

fn advance(state: &mut ReaperState, next: ReaperState) {
    debug_assert!(
        state.can_transition_to(next),
        "invalid reaper transition {state:?} -> {next:?}"
    );
    trace!(from = ?*state, to = ?next, "reaper state");
    *state = next;
}

/// Deferred-delete files inside each mount, without crossing into other
/// filesystems. Unreadable directories are skipped.
pub fn scan_artifacts<'a, I>(mounts: I) -> Vec<FuseArtifact>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut seen = BTreeSet::new();
    let mut artifacts = Vec::new();

    for mount in mounts {
        let walker = WalkDir::new(mount)
            .same_file_system(true)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, mount = %mount.display(), "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_artifact_name(entry.file_name()) {
                continue;
            }
            let path = entry.into_path();
            if seen.insert(path.clone()) {
                artifacts.push(FuseArtifact {
                    mount: mount.to_path_buf(),
                    path,
                    holder_pids: BTreeSet::new(),
                });
            }
        }
    }

    artifacts
}

fn is_artifact_name(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with(ARTIFACT_PREFIX))
}
