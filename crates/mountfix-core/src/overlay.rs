// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Permission-forcing overlay mounts.
//!
//! The overlay is a bindfs mount of a path onto itself that reports every
//! file as owned by the configured user/group. Once mounted, the path shows
//! up as FUSE in the mount table, which is what keeps the next startup from
//! stacking a second overlay. No marker file is written.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::{Ownership, Settings};
use crate::error::{Error, Result};
use crate::privilege::Privilege;

/// An overlay this process mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedOverlay {
    pub path: PathBuf,
    pub owner: Ownership,
}

pub struct OverlayApplier<R, P> {
    runner: R,
    privilege: P,
    tool: String,
    fuse_device: PathBuf,
    owner: Ownership,
}

impl<R: CommandRunner, P: Privilege> OverlayApplier<R, P> {
    pub fn new(runner: R, privilege: P, settings: &Settings) -> Self {
        Self {
            runner,
            privilege,
            tool: settings.overlay_tool.clone(),
            fuse_device: settings.fuse_device.clone(),
            owner: settings.owner,
        }
    }

    pub fn owner(&self) -> Ownership {
        self.owner
    }

    /// Resolves the overlay tool and checks the FUSE device.
    ///
    /// Called once per pass; on error no mount is attempted.
    pub fn preflight(&self) -> Result<PathBuf> {
        let tool = which::which(&self.tool).map_err(|_| Error::ToolMissing(self.tool.clone()))?;
        if !self.fuse_device.exists() {
            return Err(Error::FuseDeviceMissing(self.fuse_device.clone()));
        }
        debug!(
            operation = "overlay_preflight",
            tool = %tool.display(),
            fuse_device = %self.fuse_device.display(),
            "overlay prerequisites present"
        );
        Ok(tool)
    }

    /// The bindfs invocation for `path`, before privilege handling.
    pub fn overlay_command(&self, tool: &Path, path: &Path) -> CommandSpec {
        let Ownership { uid, gid } = self.owner;
        let target = path.to_string_lossy().into_owned();
        CommandSpec::new(tool.to_string_lossy())
            .arg(format!("--force-user={uid}"))
            .arg(format!("--force-group={gid}"))
            .arg(format!("--create-for-user={uid}"))
            .arg(format!("--create-for-group={gid}"))
            .arg("--chown-ignore")
            .arg("--chgrp-ignore")
            .args(["-o", "allow_other"])
            .arg(target.clone())
            .arg(target)
    }

    /// Mounts the overlay over `path`, through the escalation helper when
    /// this process is not privileged.
    pub fn apply(&self, tool: &Path, path: &Path) -> Result<AppliedOverlay> {
        let spec = self.privilege.prepare(self.overlay_command(tool, path));
        info!(
            operation = "apply_overlay",
            path = %path.display(),
            uid = self.owner.uid,
            gid = self.owner.gid,
            escalated = !self.privilege.is_privileged(),
            "mounting permission overlay"
        );

        let output = self.runner.run(&spec).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ToolMissing(spec.program.clone())
            } else {
                Error::Io(err)
            }
        })?;

        if !output.success {
            warn!(
                operation = "apply_overlay",
                path = %path.display(),
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "overlay mount failed; leaving mount unmodified"
            );
            return Err(Error::command_failed(&spec.program, &output.status, &output.stderr));
        }

        Ok(AppliedOverlay {
            path: path.to_path_buf(),
            owner: self.owner,
        })
    }
}
