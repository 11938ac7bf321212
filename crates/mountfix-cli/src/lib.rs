// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

use clap::{Args, Subcommand};
use mountfix_core::config::{
    ENV_DISABLE_REAPER, ENV_FUSE_DEVICE, ENV_GID, ENV_OVERLAY_MODE, ENV_OVERLAY_TOOL,
    ENV_REAP_INTERVAL, ENV_SKIP_PATHS, ENV_UID, ENV_WORKSPACE, RawSettings, Settings,
};
use mountfix_logging::CliLoggingArgs;

pub use clap::Parser;

pub mod commands;
pub mod system;

#[derive(clap::Parser)]
#[command(
    name = "mountfix",
    about = "Normalize bind-mount ownership in dev containers and reap stale FUSE artifacts",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: CliLoggingArgs,
    #[command(flatten)]
    pub settings: SettingsArgs,
    #[command(subcommand)]
    pub command: Commands,
}

/// Settings shared by every subcommand. Each flag falls back to its
/// environment variable; values are validated leniently by
/// [`Settings::resolve`].
#[derive(Args, Clone, Debug, Default)]
pub struct SettingsArgs {
    /// Workspace root whose mounts are managed
    #[arg(long, global = true, env = ENV_WORKSPACE)]
    pub workspace: Option<PathBuf>,

    /// auto, true or false
    #[arg(long, global = true, env = ENV_OVERLAY_MODE)]
    pub overlay_mode: Option<String>,

    /// Comma-separated paths never overlaid; relative entries are taken
    /// from the workspace root
    #[arg(long, global = true, env = ENV_SKIP_PATHS)]
    pub skip_paths: Option<String>,

    /// Disable the FUSE artifact reaper
    #[arg(
        long,
        global = true,
        env = ENV_DISABLE_REAPER,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub disable_reaper: Option<String>,

    /// Uid the overlay reports as owner
    #[arg(long, global = true, env = ENV_UID)]
    pub uid: Option<String>,

    /// Gid the overlay reports as group
    #[arg(long, global = true, env = ENV_GID)]
    pub gid: Option<String>,

    #[arg(long, global = true, env = ENV_OVERLAY_TOOL)]
    pub overlay_tool: Option<String>,

    #[arg(long, global = true, env = ENV_FUSE_DEVICE)]
    pub fuse_device: Option<PathBuf>,

    /// Minutes between scheduled reaper passes (1-59)
    #[arg(long = "interval-minutes", global = true, env = ENV_REAP_INTERVAL)]
    pub reap_interval_minutes: Option<String>,
}

impl SettingsArgs {
    pub fn to_raw(&self) -> RawSettings {
        RawSettings {
            workspace: self.workspace.clone(),
            overlay_mode: self.overlay_mode.clone(),
            skip_paths: self.skip_paths.clone(),
            disable_reaper: self.disable_reaper.clone(),
            uid: self.uid.clone(),
            gid: self.gid.clone(),
            overlay_tool: self.overlay_tool.clone(),
            fuse_device: self.fuse_device.clone(),
            reap_interval_minutes: self.reap_interval_minutes.clone(),
        }
    }

    pub fn resolve(&self) -> Settings {
        Settings::resolve(self.to_raw())
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Container startup: apply overlays, reap once, register the schedule
    Init(commands::InitArgs),
    /// Run the overlay pipeline only
    Apply(commands::ApplyArgs),
    /// Run one reaper pass, or keep running passes with --watch
    Reap(commands::ReapArgs),
    /// Register the periodic reaper job
    Schedule(commands::ScheduleArgs),
    /// Show how filesystem types are classified
    Classify(commands::ClassifyArgs),
    /// List workspace mounts without probing or mounting
    Status(commands::StatusArgs),
}
