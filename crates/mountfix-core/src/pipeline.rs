// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The startup pass: enumerate → classify → probe → apply.
//!
//! Runs once, synchronously, and never fails: every problem is logged and
//! recorded in the report while the rest of the pass continues.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::config::{OverlayMode, Settings};
use crate::decision::{Assessment, OverlayDecision, decide};
use crate::enumerator::enumerate;
use crate::mount_table::MountTable;
use crate::overlay::{AppliedOverlay, OverlayApplier};
use crate::privilege::Privilege;
use crate::prober::{PermissionFs, probe};

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    /// Compute decisions (probes included) without mounting anything.
    pub dry_run: bool,
}

/// What happened to the overlay at one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum OverlayStatus {
    /// Already FUSE-backed; not a candidate.
    AlreadyPresent,
    /// The decision was a skip.
    NotNeeded,
    Applied,
    DryRun,
    /// Overlay tool or FUSE device missing.
    Unavailable { error: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MountReport {
    pub path: PathBuf,
    pub fstype: String,
    pub already_fuse: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<Assessment>,
    pub overlay: OverlayStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub workspace_root: PathBuf,
    pub mode: OverlayMode,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_table_error: Option<String>,
    pub mounts: Vec<MountReport>,
    pub applied: Vec<AppliedOverlay>,
}

impl PipelineReport {
    /// Number of probes that ran during the pass.
    pub fn probe_count(&self) -> usize {
        self.mounts
            .iter()
            .filter(|m| m.assessment.as_ref().is_some_and(|a| a.probe.is_some()))
            .count()
    }

    pub fn decision_for(&self, path: &std::path::Path) -> Option<OverlayDecision> {
        self.mounts
            .iter()
            .find(|m| m.path == path)
            .and_then(|m| m.assessment.as_ref())
            .map(|a| a.decision)
    }
}

/// Runs the startup pass against the given collaborators.
pub fn run_startup_pipeline<T, F, R, P>(
    settings: &Settings,
    table: &T,
    fs: &F,
    applier: &OverlayApplier<R, P>,
    options: PipelineOptions,
) -> PipelineReport
where
    T: MountTable,
    F: PermissionFs,
    R: CommandRunner,
    P: Privilege,
{
    let mut report = PipelineReport {
        workspace_root: settings.workspace_root.clone(),
        mode: settings.overlay_mode,
        dry_run: options.dry_run,
        mount_table_error: None,
        mounts: Vec::new(),
        applied: Vec::new(),
    };

    let mounts = match enumerate(table, &settings.workspace_root) {
        Ok(mounts) => mounts,
        Err(err) => {
            warn!(
                error = %err,
                operation = "startup_pipeline",
                root = %settings.workspace_root.display(),
                "could not read the mount table; leaving workspace mounts untouched"
            );
            report.mount_table_error = Some(err.to_string());
            return report;
        }
    };

    if mounts.is_empty() {
        info!(
            operation = "startup_pipeline",
            root = %settings.workspace_root.display(),
            "no mounts under workspace root; nothing to do"
        );
    }

    // Resolved lazily so that a pass with nothing to apply never looks for
    // the tool, and a missing tool is logged once.
    let mut preflight: Option<Result<PathBuf, String>> = None;

    for mount in mounts {
        if mount.already_fuse {
            info!(
                operation = "startup_pipeline",
                path = %mount.path.display(),
                fstype = %mount.fstype,
                "mount is already FUSE-backed; skipping"
            );
            report.mounts.push(MountReport {
                path: mount.path,
                fstype: mount.fstype,
                already_fuse: true,
                assessment: None,
                overlay: OverlayStatus::AlreadyPresent,
            });
            continue;
        }

        let assessment = decide(settings.overlay_mode, &settings.skip_list, &mount, |m| {
            probe(fs, &m.path)
        });
        info!(
            operation = "startup_pipeline",
            path = %mount.path.display(),
            fstype = %mount.fstype,
            classification = %assessment.classification,
            probe = ?assessment.probe,
            decision = %assessment.decision,
            "overlay decision"
        );

        let overlay = if assessment.decision != OverlayDecision::Apply {
            OverlayStatus::NotNeeded
        } else {
            let tool = preflight.get_or_insert_with(|| {
                applier.preflight().map_err(|err| {
                    warn!(error = %err, operation = "startup_pipeline", "overlay prerequisites missing; no overlays will be applied");
                    err.to_string()
                })
            });
            match tool {
                Err(error) => OverlayStatus::Unavailable {
                    error: error.clone(),
                },
                Ok(_) if options.dry_run => OverlayStatus::DryRun,
                Ok(tool) => match applier.apply(tool, &mount.path) {
                    Ok(applied) => {
                        report.applied.push(applied);
                        OverlayStatus::Applied
                    }
                    Err(err) => {
                        warn!(error = %err, operation = "startup_pipeline", path = %mount.path.display(), "overlay not applied");
                        OverlayStatus::Failed {
                            error: err.to_string(),
                        }
                    }
                },
            }
        };

        report.mounts.push(MountReport {
            path: mount.path,
            fstype: mount.fstype,
            already_fuse: false,
            assessment: Some(assessment),
            overlay,
        });
    }

    info!(
        operation = "startup_pipeline",
        mounts = report.mounts.len(),
        applied = report.applied.len(),
        dry_run = options.dry_run,
        "startup pipeline finished"
    );
    report
}
