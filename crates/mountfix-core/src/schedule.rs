// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Registration of the periodic reaper pass with the system scheduler.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{Error, Result};
use crate::privilege::Privilege;

pub const REAPER_JOB_NAME: &str = "mountfix-reaper";
const CRON_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A command run on a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub name: String,
    pub interval_minutes: u32,
    pub user: String,
    pub command: Vec<String>,
}

impl ScheduledJob {
    /// `<exe> reap --workspace <root>` as root every `interval_minutes`.
    pub fn reaper(exe: &Path, workspace_root: &Path, interval_minutes: u32) -> Self {
        Self {
            name: REAPER_JOB_NAME.to_string(),
            interval_minutes,
            user: "root".to_string(),
            command: vec![
                exe.to_string_lossy().into_owned(),
                "reap".to_string(),
                "--workspace".to_string(),
                workspace_root.to_string_lossy().into_owned(),
            ],
        }
    }

    fn schedule_expression(&self) -> String {
        match self.interval_minutes {
            n @ 1..=59 => format!("*/{n} * * * *"),
            _ => "0 * * * *".to_string(),
        }
    }

    pub fn cron_line(&self) -> String {
        let command = self.command.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
        format!("{} {} {}", self.schedule_expression(), self.user, command)
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,@+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Installed(PathBuf),
    Unchanged(PathBuf),
}

pub trait Scheduler {
    fn register(&self, job: &ScheduledJob) -> Result<Registration>;
}

/// Writes one file per job into a cron.d directory.
pub struct CronDScheduler<R, P> {
    dir: PathBuf,
    runner: R,
    privilege: P,
}

impl<R: CommandRunner, P: Privilege> CronDScheduler<R, P> {
    pub fn new(runner: R, privilege: P) -> Self {
        Self::in_dir("/etc/cron.d", runner, privilege)
    }

    pub fn in_dir(dir: impl Into<PathBuf>, runner: R, privilege: P) -> Self {
        Self {
            dir: dir.into(),
            runner,
            privilege,
        }
    }

    pub fn render(job: &ScheduledJob) -> String {
        format!(
            "# Installed by mountfix; removes unheld FUSE deferred-delete files.\n\
             SHELL=/bin/sh\n\
             PATH={CRON_PATH}\n\
             {}\n",
            job.cron_line()
        )
    }
}

impl<R: CommandRunner, P: Privilege> Scheduler for CronDScheduler<R, P> {
    fn register(&self, job: &ScheduledJob) -> Result<Registration> {
        if !self.dir.is_dir() {
            return Err(Error::Schedule(format!(
                "{} does not exist; is cron installed?",
                self.dir.display()
            )));
        }

        let path = self.dir.join(&job.name);
        let content = Self::render(job);
        if std::fs::read_to_string(&path).is_ok_and(|existing| existing == content) {
            info!(operation = "register_schedule", path = %path.display(), "scheduled job already installed");
            return Ok(Registration::Unchanged(path));
        }

        if self.privilege.is_privileged() {
            std::fs::write(&path, &content)?;
        } else {
            let spec = self.privilege.escalate(
                CommandSpec::new("tee")
                    .arg(path.to_string_lossy())
                    .stdin(content.into_bytes()),
            );
            let output = self.runner.run(&spec)?;
            if !output.success {
                return Err(Error::command_failed(&spec.program, &output.status, &output.stderr));
            }
        }

        info!(
            operation = "register_schedule",
            path = %path.display(),
            interval_minutes = job.interval_minutes,
            "scheduled job installed"
        );
        Ok(Registration::Installed(path))
    }
}
