// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host implementations of the core traits.

use mountfix_core::command::SystemRunner;
use mountfix_core::config::Settings;
use mountfix_core::holders::ProcFdHolders;
use mountfix_core::mount_table::{FallbackMountTable, Findmnt, ProcMountInfo};
use mountfix_core::overlay::OverlayApplier;
use mountfix_core::privilege::SudoEscalator;
use mountfix_core::reaper::Reaper;
use mountfix_core::schedule::CronDScheduler;
use mountfix_core::syslog::{LoggerCommand, REAPER_LOG_TAG};

pub type HostMountTable = FallbackMountTable<Findmnt<SystemRunner>, ProcMountInfo>;
pub type HostApplier = OverlayApplier<SystemRunner, SudoEscalator>;
pub type HostReaper = Reaper<HostMountTable, ProcFdHolders, LoggerCommand<SystemRunner>>;
pub type HostScheduler = CronDScheduler<SystemRunner, SudoEscalator>;

/// findmnt, falling back to `/proc/self/mountinfo` when it is not installed.
pub fn mount_table() -> HostMountTable {
    FallbackMountTable::new(Findmnt::new(SystemRunner), ProcMountInfo::new())
}

pub fn applier(settings: &Settings) -> HostApplier {
    OverlayApplier::new(SystemRunner, SudoEscalator::detect(), settings)
}

pub fn reaper(settings: &Settings) -> HostReaper {
    Reaper::new(
        mount_table(),
        ProcFdHolders::new(),
        LoggerCommand::new(SystemRunner, REAPER_LOG_TAG),
        settings.workspace_root.clone(),
        settings.reaper_disabled,
    )
}

pub fn scheduler() -> HostScheduler {
    CronDScheduler::new(SystemRunner, SudoEscalator::detect())
}
