// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

/// Errors produced by the mountfix components.
///
/// None of these abort the startup sequence; the pipeline and the reaper turn
/// them into warnings and skip the affected mount or file.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mount table query via {tool} is unavailable: {source}")]
    MountTableUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse mount table: {0}")]
    MountTableParse(String),
    #[error("overlay tool `{0}` not found in PATH")]
    ToolMissing(String),
    #[error("FUSE device {} is not available", .0.display())]
    FuseDeviceMissing(PathBuf),
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("holder scan for {} is incomplete: {reason}", path.display())]
    HolderScanIncomplete { path: PathBuf, reason: String },
    #[error("scheduler registration failed: {0}")]
    Schedule(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn command_failed(program: &str, status: impl ToString, stderr: &[u8]) -> Self {
        Self::CommandFailed {
            program: program.to_string(),
            status: status.to_string(),
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
