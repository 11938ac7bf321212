// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Subcommand implementations.
//!
//! Degradations (missing overlay tool, unreadable mount table, failed
//! registration) are reported in the output and logged, never turned into a
//! non-zero exit: a container must keep starting.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use mountfix_core::classifier::{Classification, classify};
use mountfix_core::command::{CommandRunner, CommandSpec, SystemRunner};
use mountfix_core::config::Settings;
use mountfix_core::enumerator::enumerate;
use mountfix_core::pipeline::{
    MountReport, OverlayStatus, PipelineOptions, PipelineReport, run_startup_pipeline,
};
use mountfix_core::privilege::{Privilege, SudoEscalator};
use mountfix_core::prober::HostFs;
use mountfix_core::reaper::{ReapAction, ReapReport, ReapTrigger};
use mountfix_core::schedule::{Registration, ScheduledJob, Scheduler};
use serde::Serialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::system::{self, HostReaper};

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Result of registering the periodic reaper job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ScheduleOutcome {
    Installed { path: PathBuf },
    Unchanged { path: PathBuf },
    /// The reaper is disabled; any existing entry is left as it is.
    Skipped,
    Failed { error: String },
}

/// Registers the reaper job unless the reaper is disabled.
pub fn register_reaper<S: Scheduler>(
    settings: &Settings,
    scheduler: &S,
    exe: std::io::Result<PathBuf>,
) -> ScheduleOutcome {
    if settings.reaper_disabled {
        info!(operation = "register_schedule", "reaper disabled; not registering the periodic job");
        return ScheduleOutcome::Skipped;
    }

    let exe = match exe {
        Ok(exe) => exe,
        Err(err) => {
            warn!(error = %err, operation = "register_schedule", "cannot locate the mountfix executable");
            return ScheduleOutcome::Failed {
                error: format!("cannot locate the mountfix executable: {err}"),
            };
        }
    };

    let job = ScheduledJob::reaper(&exe, &settings.workspace_root, settings.reap_interval_minutes);
    match scheduler.register(&job) {
        Ok(Registration::Installed(path)) => ScheduleOutcome::Installed { path },
        Ok(Registration::Unchanged(path)) => ScheduleOutcome::Unchanged { path },
        Err(err) => {
            warn!(error = %err, operation = "register_schedule", "periodic reaper not registered");
            ScheduleOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

/// `<exe> reap --boot --json --workspace <root>`, escalated unless already root.
pub fn boot_pass_command<P: Privilege>(privilege: &P, exe: &Path, settings: &Settings) -> CommandSpec {
    privilege.prepare(
        CommandSpec::new(exe.to_string_lossy())
            .args(["reap", "--boot", "--json", "--workspace"])
            .arg(settings.workspace_root.to_string_lossy()),
    )
}

/// Runs the boot pass in a child process and reads back its JSON report.
///
/// Reading other users' `/proc/<pid>/fd` needs root; an unprivileged pass
/// would retain every artifact.
pub fn delegated_boot_pass<R: CommandRunner, P: Privilege>(
    settings: &Settings,
    runner: &R,
    privilege: &P,
    exe: std::io::Result<PathBuf>,
) -> anyhow::Result<ReapReport> {
    let exe = exe.context("cannot locate the mountfix executable")?;
    let spec = boot_pass_command(privilege, &exe, settings);
    let output = runner
        .run(&spec)
        .with_context(|| format!("failed to start `{spec}`"))?;
    if !output.success {
        anyhow::bail!(
            "`{spec}` failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    serde_json::from_slice(&output.stdout).context("unreadable report from the boot reaper pass")
}

fn boot_pass(settings: &Settings) -> ReapReport {
    let privilege = SudoEscalator::detect();
    if !privilege.is_privileged() && !settings.reaper_disabled {
        match delegated_boot_pass(settings, &SystemRunner, &privilege, std::env::current_exe()) {
            Ok(report) => return report,
            Err(err) => warn!(
                error = %format!("{err:#}"),
                operation = "reap",
                "boot pass as root failed; reaping with current privileges"
            ),
        }
    }
    system::reaper(settings).run_pass(ReapTrigger::Boot)
}

fn overlay_label(status: &OverlayStatus) -> String {
    match status {
        OverlayStatus::AlreadyPresent => "overlay present".to_string(),
        OverlayStatus::NotNeeded => "unchanged".to_string(),
        OverlayStatus::Applied => "overlay applied".to_string(),
        OverlayStatus::DryRun => "would apply overlay".to_string(),
        OverlayStatus::Unavailable { error } | OverlayStatus::Failed { error } => {
            format!("not applied: {error}")
        }
    }
}

fn mount_line(mount: &MountReport) -> String {
    let decision = mount
        .assessment
        .as_ref()
        .map(|a| a.decision.to_string())
        .unwrap_or_else(|| "already-fuse".to_string());
    format!(
        "{}  {}  {}  {}",
        mount.path.display(),
        mount.fstype,
        decision,
        overlay_label(&mount.overlay)
    )
}

pub fn render_pipeline(report: &PipelineReport) -> String {
    let mut out = String::new();
    if let Some(err) = &report.mount_table_error {
        let _ = writeln!(out, "mount table unavailable, no overlays applied: {err}");
        return out;
    }
    if report.mounts.is_empty() {
        let _ = writeln!(out, "no mounts under {}", report.workspace_root.display());
        return out;
    }
    for mount in &report.mounts {
        let _ = writeln!(out, "{}", mount_line(mount));
    }
    out
}

pub fn render_reap(report: &ReapReport) -> String {
    let mut out = String::new();
    if report.disabled {
        let _ = writeln!(out, "reaper disabled");
        return out;
    }
    if let Some(err) = &report.mount_table_error {
        let _ = writeln!(out, "mount table unavailable, nothing reaped: {err}");
        return out;
    }
    for entry in &report.entries {
        let action = match &entry.action {
            ReapAction::Removed => "removed".to_string(),
            ReapAction::Retained { holders } => {
                let pids: Vec<String> = holders.iter().map(u32::to_string).collect();
                format!("retained (held by pid {})", pids.join(","))
            }
            ReapAction::HolderCheckFailed { error } => format!("retained (holder check failed: {error})"),
            ReapAction::RemoveFailed { error } => format!("not removed: {error}"),
        };
        let _ = writeln!(out, "{}  {action}", entry.path.display());
    }
    let _ = writeln!(
        out,
        "{} FUSE mount(s) scanned, {} removed, {} retained",
        report.mounts.len(),
        report.removed().count(),
        report.retained().count()
    );
    out
}

pub fn render_schedule(outcome: &ScheduleOutcome) -> String {
    match outcome {
        ScheduleOutcome::Installed { path } => format!("reaper job installed at {}\n", path.display()),
        ScheduleOutcome::Unchanged { path } => format!("reaper job already installed at {}\n", path.display()),
        ScheduleOutcome::Skipped => "reaper disabled; job not registered\n".to_string(),
        ScheduleOutcome::Failed { error } => format!("reaper job not registered: {error}\n"),
    }
}

#[derive(Serialize)]
struct InitReport {
    pipeline: PipelineReport,
    reap: ReapReport,
    schedule: ScheduleOutcome,
}

#[derive(Args, Clone, Debug, Default)]
pub struct InitArgs {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl InitArgs {
    pub fn run(self, settings: &Settings) -> anyhow::Result<()> {
        info!(
            operation = "init",
            root = %settings.workspace_root.display(),
            mode = %settings.overlay_mode,
            reaper_disabled = settings.reaper_disabled,
            "startup sequence beginning"
        );

        let pipeline = run_startup_pipeline(
            settings,
            &system::mount_table(),
            &HostFs,
            &system::applier(settings),
            PipelineOptions::default(),
        );
        let reap = boot_pass(settings);
        let schedule = register_reaper(settings, &system::scheduler(), std::env::current_exe());

        if self.json {
            return print_json(&InitReport {
                pipeline,
                reap,
                schedule,
            });
        }
        print!("{}", render_pipeline(&pipeline));
        print!("{}", render_reap(&reap));
        print!("{}", render_schedule(&schedule));
        Ok(())
    }
}

#[derive(Args, Clone, Debug, Default)]
pub struct ApplyArgs {
    /// Decide (probes included) without mounting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ApplyArgs {
    pub fn run(self, settings: &Settings) -> anyhow::Result<()> {
        let report = run_startup_pipeline(
            settings,
            &system::mount_table(),
            &HostFs,
            &system::applier(settings),
            PipelineOptions {
                dry_run: self.dry_run,
            },
        );
        if self.json {
            return print_json(&report);
        }
        print!("{}", render_pipeline(&report));
        Ok(())
    }
}

#[derive(Args, Clone, Debug, Default)]
pub struct ReapArgs {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Keep running a pass every interval until SIGINT/SIGTERM
    #[arg(long)]
    pub watch: bool,

    /// Record the pass as the startup pass; set by `init` when it
    /// re-executes itself as root
    #[arg(long, hide = true, conflicts_with = "watch")]
    pub boot: bool,
}

impl ReapArgs {
    pub async fn run(self, settings: &Settings) -> anyhow::Result<()> {
        let reaper = system::reaper(settings);
        if self.watch {
            return self.watch_passes(&reaper, settings.reap_interval_minutes).await;
        }
        let trigger = if self.boot {
            ReapTrigger::Boot
        } else {
            ReapTrigger::Scheduled
        };
        let report = reaper.run_pass(trigger);
        self.emit(&report)
    }

    fn emit(&self, report: &ReapReport) -> anyhow::Result<()> {
        if self.json {
            print_json(report)
        } else {
            print!("{}", render_reap(report));
            Ok(())
        }
    }

    async fn watch_passes(&self, reaper: &HostReaper, interval_minutes: u32) -> anyhow::Result<()> {
        if reaper.is_disabled() {
            info!(operation = "reap_watch", "reaper disabled; nothing to watch");
            return Ok(());
        }

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(interval_minutes) * 60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(operation = "reap_watch", interval_minutes, "running reaper passes until stopped");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = reaper.run_pass(ReapTrigger::Scheduled);
                    self.emit(&report)?;
                }
                _ = sigint.recv() => {
                    info!(operation = "shutdown", signal = "SIGINT", "Received SIGINT, stopping reaper");
                    break;
                }
                _ = sigterm.recv() => {
                    info!(operation = "shutdown", signal = "SIGTERM", "Received SIGTERM, stopping reaper");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[derive(Args, Clone, Debug, Default)]
pub struct ScheduleArgs {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ScheduleArgs {
    pub fn run(self, settings: &Settings) -> anyhow::Result<()> {
        let outcome = register_reaper(settings, &system::scheduler(), std::env::current_exe());
        if self.json {
            return print_json(&outcome);
        }
        print!("{}", render_schedule(&outcome));
        Ok(())
    }
}

#[derive(Serialize)]
struct TypeVerdict<'a> {
    fstype: &'a str,
    classification: Classification,
}

#[derive(Args, Clone, Debug, Default)]
pub struct ClassifyArgs {
    /// Filesystem type names as reported by the mount table
    #[arg(required = true)]
    pub fstypes: Vec<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ClassifyArgs {
    pub fn run(self) -> anyhow::Result<()> {
        let verdicts: Vec<TypeVerdict<'_>> = self
            .fstypes
            .iter()
            .map(|fstype| TypeVerdict {
                fstype,
                classification: classify(fstype),
            })
            .collect();
        if self.json {
            return print_json(&verdicts);
        }
        for v in &verdicts {
            println!("{}\t{}", v.fstype, v.classification);
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct MountStatus {
    path: PathBuf,
    fstype: String,
    already_fuse: bool,
    classification: Classification,
}

#[derive(Args, Clone, Debug, Default)]
pub struct StatusArgs {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, settings: &Settings) -> anyhow::Result<()> {
        let mounts = enumerate(&system::mount_table(), &settings.workspace_root)
            .context("failed to enumerate workspace mounts")?;
        let rows: Vec<MountStatus> = mounts
            .into_iter()
            .map(|m| MountStatus {
                classification: classify(&m.fstype),
                path: m.path,
                fstype: m.fstype,
                already_fuse: m.already_fuse,
            })
            .collect();

        if self.json {
            return print_json(&rows);
        }
        if rows.is_empty() {
            println!("no mounts under {}", settings.workspace_root.display());
        }
        for row in &rows {
            let fuse = if row.already_fuse { "fuse" } else { "-" };
            println!(
                "{}  {}  {}  {}",
                row.path.display(),
                row.fstype,
                fuse,
                row.classification
            );
        }
        Ok(())
    }
}
