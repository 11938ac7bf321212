// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-lifetime configuration.
//!
//! Values arrive as strings (environment or flags) and are resolved leniently:
//! a malformed value falls back to the nearest safe default with a warning
//! instead of failing startup.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::skip_list::{SkipList, normalize_path};

pub const ENV_WORKSPACE: &str = "MOUNTFIX_WORKSPACE";
pub const ENV_OVERLAY_MODE: &str = "MOUNTFIX_OVERLAY_MODE";
pub const ENV_SKIP_PATHS: &str = "MOUNTFIX_SKIP_PATHS";
pub const ENV_DISABLE_REAPER: &str = "MOUNTFIX_DISABLE_REAPER";
pub const ENV_UID: &str = "MOUNTFIX_UID";
pub const ENV_GID: &str = "MOUNTFIX_GID";
pub const ENV_OVERLAY_TOOL: &str = "MOUNTFIX_OVERLAY_TOOL";
pub const ENV_FUSE_DEVICE: &str = "MOUNTFIX_FUSE_DEVICE";
pub const ENV_REAP_INTERVAL: &str = "MOUNTFIX_REAP_INTERVAL_MINUTES";

pub const DEFAULT_WORKSPACE: &str = "/workspaces";
pub const DEFAULT_OVERLAY_TOOL: &str = "bindfs";
pub const DEFAULT_FUSE_DEVICE: &str = "/dev/fuse";
pub const DEFAULT_REAP_INTERVAL_MINUTES: u32 = 10;

/// How the overlay decision is made for each mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    /// Classify and probe each mount.
    #[default]
    Auto,
    /// Apply to every eligible mount.
    Always,
    /// Skip the applier entirely.
    Never,
}

impl OverlayMode {
    /// Parses a mode; `None` when the value is not recognized.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "true" | "always" | "yes" | "on" | "1" => Some(Self::Always),
            "false" | "never" | "no" | "off" | "0" => Some(Self::Never),
            _ => None,
        }
    }

    /// Parses a mode, falling back to `auto` on unrecognized input.
    pub fn parse_lenient(value: &str) -> Self {
        Self::parse(value).unwrap_or_else(|| {
            warn!(
                operation = "resolve_config",
                key = ENV_OVERLAY_MODE,
                value = %value,
                "unrecognized overlay mode; falling back to auto"
            );
            Self::Auto
        })
    }
}

impl fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlayMode::Auto => write!(f, "auto"),
            OverlayMode::Always => write!(f, "true"),
            OverlayMode::Never => write!(f, "false"),
        }
    }
}

/// User/group the overlay forces ownership to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The user who invoked mountfix: `SUDO_UID`/`SUDO_GID` when running
    /// under sudo, otherwise the real uid/gid.
    pub fn invoking_user() -> Self {
        let (real_uid, real_gid) = real_ids();
        let from_env = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok());
        Self {
            uid: from_env("SUDO_UID").unwrap_or(real_uid),
            gid: from_env("SUDO_GID").unwrap_or(real_gid),
        }
    }
}

#[cfg(unix)]
fn real_ids() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

#[cfg(not(unix))]
fn real_ids() -> (u32, u32) {
    (0, 0)
}

/// Unvalidated settings exactly as read from the environment or flags.
#[derive(Debug, Clone, Default)]
pub struct RawSettings {
    pub workspace: Option<PathBuf>,
    pub overlay_mode: Option<String>,
    pub skip_paths: Option<String>,
    pub disable_reaper: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub overlay_tool: Option<String>,
    pub fuse_device: Option<PathBuf>,
    pub reap_interval_minutes: Option<String>,
}

impl RawSettings {
    /// Reads every key through `lookup`, e.g. `|k| std::env::var(k).ok()`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            workspace: lookup(ENV_WORKSPACE).map(PathBuf::from),
            overlay_mode: lookup(ENV_OVERLAY_MODE),
            skip_paths: lookup(ENV_SKIP_PATHS),
            disable_reaper: lookup(ENV_DISABLE_REAPER),
            uid: lookup(ENV_UID),
            gid: lookup(ENV_GID),
            overlay_tool: lookup(ENV_OVERLAY_TOOL),
            fuse_device: lookup(ENV_FUSE_DEVICE).map(PathBuf::from),
            reap_interval_minutes: lookup(ENV_REAP_INTERVAL),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Resolved configuration handed to every component.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub workspace_root: PathBuf,
    pub overlay_mode: OverlayMode,
    pub skip_list: SkipList,
    pub reaper_disabled: bool,
    pub owner: Ownership,
    pub overlay_tool: String,
    pub fuse_device: PathBuf,
    pub reap_interval_minutes: u32,
}

impl Settings {
    pub fn resolve(raw: RawSettings) -> Self {
        Self::resolve_with_owner(raw, Ownership::invoking_user())
    }

    /// Like [`Settings::resolve`], with an explicit fallback for uid/gid.
    pub fn resolve_with_owner(raw: RawSettings, fallback_owner: Ownership) -> Self {
        let workspace_root = normalize_path(
            &raw.workspace.unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE)),
        );

        let overlay_mode = raw
            .overlay_mode
            .as_deref()
            .map(OverlayMode::parse_lenient)
            .unwrap_or_default();

        let skip_list = raw
            .skip_paths
            .as_deref()
            .map(|s| SkipList::parse(s, &workspace_root))
            .unwrap_or_default();

        let reaper_disabled = raw.disable_reaper.as_deref().map(parse_flag).unwrap_or(false);

        let owner = Ownership {
            uid: parse_id(ENV_UID, raw.uid.as_deref(), fallback_owner.uid),
            gid: parse_id(ENV_GID, raw.gid.as_deref(), fallback_owner.gid),
        };

        let overlay_tool = raw
            .overlay_tool
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OVERLAY_TOOL.to_string());

        let fuse_device = raw.fuse_device.unwrap_or_else(|| PathBuf::from(DEFAULT_FUSE_DEVICE));

        let reap_interval_minutes = match raw.reap_interval_minutes.as_deref() {
            None => DEFAULT_REAP_INTERVAL_MINUTES,
            Some(value) => match value.trim().parse::<u32>() {
                Ok(minutes) if (1..=59).contains(&minutes) => minutes,
                _ => {
                    warn!(
                        operation = "resolve_config",
                        key = ENV_REAP_INTERVAL,
                        value = %value,
                        default = DEFAULT_REAP_INTERVAL_MINUTES,
                        "reap interval must be 1-59 minutes; using default"
                    );
                    DEFAULT_REAP_INTERVAL_MINUTES
                }
            },
        };

        Self {
            workspace_root,
            overlay_mode,
            skip_list,
            reaper_disabled,
            owner,
            overlay_tool,
            fuse_device,
            reap_interval_minutes,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_id(key: &str, value: Option<&str>, fallback: u32) -> u32 {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => fallback,
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!(operation = "resolve_config", key, value = %v, fallback, "invalid id; using fallback");
            fallback
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let raw = RawSettings::from_lookup(|k| map.get(k).cloned());
        Settings::resolve_with_owner(raw, Ownership::new(1000, 1000))
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let settings = resolve(&[]);
        assert_eq!(settings.overlay_mode, OverlayMode::Auto);
        assert!(settings.skip_list.is_empty());
        assert!(!settings.reaper_disabled);
        assert_eq!(settings.owner, Ownership::new(1000, 1000));
        assert_eq!(settings.overlay_tool, "bindfs");
        assert_eq!(settings.fuse_device, PathBuf::from("/dev/fuse"));
        assert_eq!(settings.reap_interval_minutes, 10);
    }

    #[test]
    fn overlay_mode_accepts_boolean_spellings() {
        assert_eq!(OverlayMode::parse("TRUE"), Some(OverlayMode::Always));
        assert_eq!(OverlayMode::parse("false"), Some(OverlayMode::Never));
        assert_eq!(OverlayMode::parse(" auto "), Some(OverlayMode::Auto));
        assert_eq!(OverlayMode::parse("sometimes"), None);
    }

    #[test]
    fn unrecognized_mode_falls_back_to_auto() {
        let settings = resolve(&[(ENV_OVERLAY_MODE, "maybe")]);
        assert_eq!(settings.overlay_mode, OverlayMode::Auto);
    }

    #[test]
    fn reaper_flag_only_disables_on_truthy_values() {
        assert!(resolve(&[(ENV_DISABLE_REAPER, "true")]).reaper_disabled);
        assert!(resolve(&[(ENV_DISABLE_REAPER, "1")]).reaper_disabled);
        assert!(!resolve(&[(ENV_DISABLE_REAPER, "")]).reaper_disabled);
        assert!(!resolve(&[(ENV_DISABLE_REAPER, "nope")]).reaper_disabled);
    }

    #[test]
    fn invalid_ids_use_fallback() {
        let settings = resolve(&[(ENV_UID, "abc"), (ENV_GID, "2000")]);
        assert_eq!(settings.owner, Ownership::new(1000, 2000));
    }

    #[test]
    fn out_of_range_interval_uses_default() {
        assert_eq!(resolve(&[(ENV_REAP_INTERVAL, "0")]).reap_interval_minutes, 10);
        assert_eq!(resolve(&[(ENV_REAP_INTERVAL, "90")]).reap_interval_minutes, 10);
        assert_eq!(resolve(&[(ENV_REAP_INTERVAL, "5")]).reap_interval_minutes, 5);
    }

    #[test]
    fn skip_paths_resolve_against_workspace() {
        let settings = resolve(&[
            (ENV_WORKSPACE, "/mountfix-test-root/ws"),
            (ENV_SKIP_PATHS, "vendor,/mountfix-test-root/ws/cache/"),
        ]);
        assert_eq!(
            settings.skip_list.entries(),
            &[
                PathBuf::from("/mountfix-test-root/ws/vendor"),
                PathBuf::from("/mountfix-test-root/ws/cache"),
            ]
        );
    }
}
