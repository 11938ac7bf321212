// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operator-visible system log lines.

use std::cell::Cell;

use tracing::{debug, warn};

use crate::command::{CommandRunner, CommandSpec};

/// Source identifier attached to every reaper line.
pub const REAPER_LOG_TAG: &str = "fuse-artifact-reaper";

pub trait SystemLog {
    fn record(&self, line: &str);
}

impl<L: SystemLog + ?Sized> SystemLog for &L {
    fn record(&self, line: &str) {
        (**self).record(line)
    }
}

/// Sends lines to syslog through `logger -t <tag>`.
///
/// If `logger` is missing the first failure is logged and later lines are
/// dropped; the reaper's own tracing output still carries them.
pub struct LoggerCommand<R> {
    runner: R,
    tag: String,
    available: Cell<bool>,
}

impl<R: CommandRunner> LoggerCommand<R> {
    pub fn new(runner: R, tag: impl Into<String>) -> Self {
        Self {
            runner,
            tag: tag.into(),
            available: Cell::new(true),
        }
    }
}

impl<R: CommandRunner> SystemLog for LoggerCommand<R> {
    fn record(&self, line: &str) {
        if !self.available.get() {
            return;
        }
        let spec = CommandSpec::new("logger").args(["-t", self.tag.as_str(), "--", line]);
        match self.runner.run(&spec) {
            Ok(output) if output.success => {}
            Ok(output) => {
                debug!(status = %output.status, "logger exited unsuccessfully");
            }
            Err(err) => {
                warn!(error = %err, tag = %self.tag, "system logger unavailable; reaper lines go to the application log only");
                self.available.set(false);
            }
        }
    }
}
