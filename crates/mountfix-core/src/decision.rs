// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-mount overlay decision.

use std::fmt;

use serde::Serialize;

use crate::classifier::{Classification, classify};
use crate::config::OverlayMode;
use crate::enumerator::MountPoint;
use crate::prober::ProbeOutcome;
use crate::skip_list::SkipList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayDecision {
    Apply,
    SkipByConfiguration,
    SkipByList,
    SkipAlreadyCorrect,
}

impl fmt::Display for OverlayDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayDecision::Apply => write!(f, "apply"),
            OverlayDecision::SkipByConfiguration => write!(f, "skip-by-configuration"),
            OverlayDecision::SkipByList => write!(f, "skip-by-list"),
            OverlayDecision::SkipAlreadyCorrect => write!(f, "skip-already-correct"),
        }
    }
}

/// Everything learned about one mount on the way to its decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assessment {
    pub classification: Classification,
    /// Present only when a probe actually ran.
    pub probe: Option<ProbeOutcome>,
    pub decision: OverlayDecision,
}

/// Decides whether `mount` gets an overlay.
///
/// `run_probe` is called at most once, and only in `auto` mode for a
/// `probe-required` mount that is not on the skip list. `mount` must not
/// already be FUSE-backed; the pipeline filters those out beforehand.
pub fn decide<P>(
    mode: OverlayMode,
    skip_list: &SkipList,
    mount: &MountPoint,
    run_probe: P,
) -> Assessment
where
    P: FnOnce(&MountPoint) -> ProbeOutcome,
{
    let classification = classify(&mount.fstype);
    let settled = |decision| Assessment {
        classification,
        probe: None,
        decision,
    };

    if mode == OverlayMode::Never {
        return settled(OverlayDecision::SkipByConfiguration);
    }
    if skip_list.excludes(&mount.path) {
        return settled(OverlayDecision::SkipByList);
    }
    if mode == OverlayMode::Always {
        return settled(OverlayDecision::Apply);
    }

    match classification {
        Classification::KnownBroken => settled(OverlayDecision::Apply),
        Classification::KnownGood => settled(OverlayDecision::SkipAlreadyCorrect),
        Classification::ProbeRequired => {
            let outcome = run_probe(mount);
            Assessment {
                classification,
                probe: Some(outcome),
                decision: if outcome.needs_overlay() {
                    OverlayDecision::Apply
                } else {
                    OverlayDecision::SkipAlreadyCorrect
                },
            }
        }
    }
}
