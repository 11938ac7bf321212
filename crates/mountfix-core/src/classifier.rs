// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem-type classification.
//!
//! Types are matched exactly against a small table. Anything unlisted needs
//! an empirical probe; an unknown type must never be assumed good.

use std::fmt;

use serde::Serialize;

/// Filesystem types with known permission behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsType {
    // Desktop runtime file sharing; chmod is accepted and dropped.
    Virtiofs,
    Fakeowner,
    Grpcfuse,
    Osxfs,
    Vboxsf,
    // Native filesystems.
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Zfs,
    F2fs,
    Tmpfs,
    Overlay,
}

/// Verdict for a filesystem type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    KnownBroken,
    KnownGood,
    ProbeRequired,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::KnownBroken => write!(f, "known-broken"),
            Classification::KnownGood => write!(f, "known-good"),
            Classification::ProbeRequired => write!(f, "probe-required"),
        }
    }
}

/// Names as reported by the mount table.
const KNOWN_NAMES: &[(&str, FsType)] = &[
    ("virtiofs", FsType::Virtiofs),
    ("fakeowner", FsType::Fakeowner),
    ("grpcfuse", FsType::Grpcfuse),
    ("fuse.grpcfuse", FsType::Grpcfuse),
    ("osxfs", FsType::Osxfs),
    ("vboxsf", FsType::Vboxsf),
    ("ext2", FsType::Ext2),
    ("ext3", FsType::Ext3),
    ("ext4", FsType::Ext4),
    ("xfs", FsType::Xfs),
    ("btrfs", FsType::Btrfs),
    ("zfs", FsType::Zfs),
    ("f2fs", FsType::F2fs),
    ("tmpfs", FsType::Tmpfs),
    ("overlay", FsType::Overlay),
];

impl FsType {
    /// Exact, case-sensitive lookup.
    pub fn from_name(name: &str) -> Option<Self> {
        KNOWN_NAMES.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
    }

    pub fn classification(self) -> Classification {
        match self {
            FsType::Virtiofs
            | FsType::Fakeowner
            | FsType::Grpcfuse
            | FsType::Osxfs
            | FsType::Vboxsf => Classification::KnownBroken,
            FsType::Ext2
            | FsType::Ext3
            | FsType::Ext4
            | FsType::Xfs
            | FsType::Btrfs
            | FsType::Zfs
            | FsType::F2fs
            | FsType::Tmpfs
            | FsType::Overlay => Classification::KnownGood,
        }
    }
}

/// Classifies a filesystem type name as reported by the mount table.
pub fn classify(fstype: &str) -> Classification {
    FsType::from_name(fstype)
        .map(FsType::classification)
        .unwrap_or(Classification::ProbeRequired)
}
