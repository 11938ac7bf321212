// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Live mount-table queries.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub fstype: String,
}

impl MountEntry {
    pub fn new(target: impl Into<PathBuf>, fstype: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            fstype: fstype.into(),
        }
    }
}

/// Source of mount-table rows, in table order (a later row at the same
/// target is stacked on top of an earlier one).
///
/// An empty table is `Ok(vec![])`; `Err` means the query mechanism itself is
/// unavailable or produced garbage.
pub trait MountTable {
    fn entries(&self) -> Result<Vec<MountEntry>>;
}

impl<T: MountTable + ?Sized> MountTable for &T {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        (**self).entries()
    }
}

/// `findmnt --json --list --output TARGET,FSTYPE`
pub struct Findmnt<R> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> Findmnt<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            program: "findmnt".to_string(),
        }
    }

    pub fn with_program(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

#[derive(Deserialize)]
struct FindmntDocument {
    #[serde(default)]
    filesystems: Vec<FindmntRow>,
}

#[derive(Deserialize)]
struct FindmntRow {
    target: String,
    fstype: String,
}

/// Parses findmnt's `--json --list` output.
pub fn parse_findmnt_json(json: &str) -> Result<Vec<MountEntry>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let doc: FindmntDocument = serde_json::from_str(json)
        .map_err(|e| Error::MountTableParse(format!("findmnt JSON: {e}")))?;
    Ok(doc
        .filesystems
        .into_iter()
        .map(|row| MountEntry::new(row.target, row.fstype))
        .collect())
}

impl<R: CommandRunner> MountTable for Findmnt<R> {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        let spec = CommandSpec::new(&self.program).args([
            "--json",
            "--list",
            "--output",
            "TARGET,FSTYPE",
        ]);
        let output = self.runner.run(&spec).map_err(|source| Error::MountTableUnavailable {
            tool: self.program.clone(),
            source,
        })?;

        // findmnt exits 1 when it matched nothing.
        if !output.success {
            if output.stdout.is_empty() && output.stderr.is_empty() {
                debug!(operation = "query_mount_table", "findmnt returned no rows");
                return Ok(Vec::new());
            }
            return Err(Error::command_failed(&self.program, &output.status, &output.stderr));
        }

        parse_findmnt_json(&output.stdout_lossy())
    }
}

/// Reads `/proc/self/mountinfo` directly.
pub struct ProcMountInfo {
    path: PathBuf,
}

impl ProcMountInfo {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/self/mountinfo"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMountInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable for ProcMountInfo {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|source| Error::MountTableUnavailable {
                tool: self.path.display().to_string(),
                source,
            })?;
        parse_mountinfo(&content)
    }
}

/// Parses the mountinfo format described in proc(5).
pub fn parse_mountinfo(content: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(' ').collect();
        let separator = fields.iter().position(|f| *f == "-");
        let (Some(target), Some(sep)) = (fields.get(4), separator) else {
            return Err(Error::MountTableParse(format!(
                "mountinfo line {}: missing fields",
                lineno + 1
            )));
        };
        let Some(fstype) = fields.get(sep + 1) else {
            return Err(Error::MountTableParse(format!(
                "mountinfo line {}: missing fstype",
                lineno + 1
            )));
        };
        entries.push(MountEntry::new(unescape_octal(target), *fstype));
    }
    Ok(entries)
}

/// Decodes the `\040`-style escapes the kernel uses for whitespace and
/// backslashes in mount paths.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Tries `primary` and falls back to `secondary` when the primary query
/// mechanism is missing.
pub struct FallbackMountTable<P, S> {
    primary: P,
    secondary: S,
}

impl<P: MountTable, S: MountTable> FallbackMountTable<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P: MountTable, S: MountTable> MountTable for FallbackMountTable<P, S> {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        match self.primary.entries() {
            Err(err @ Error::MountTableUnavailable { .. }) => {
                warn!(error = %err, operation = "query_mount_table", "primary mount table query unavailable; trying fallback");
                self.secondary.entries()
            }
            other => other,
        }
    }
}
