// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core of mountfix: makes host bind mounts under a dev-container workspace
//! report the container user as owner, and cleans up the `.fuse_hidden*`
//! files the resulting FUSE overlays leave behind.
//!
//! The startup pass lives in [`pipeline`], the cleanup pass in [`reaper`].
//! Every system interaction sits behind a small trait (`MountTable`,
//! `PermissionFs`, `CommandRunner`, `Privilege`, `HolderQuery`, `SystemLog`,
//! `Scheduler`) so both passes run against fakes in tests.

pub mod classifier;
pub mod command;
pub mod config;
pub mod decision;
pub mod enumerator;
pub mod error;
pub mod holders;
pub mod mount_table;
pub mod overlay;
pub mod pipeline;
pub mod prober;
pub mod privilege;
pub mod reaper;
pub mod schedule;
pub mod skip_list;
pub mod syslog;

pub use error::{Error, Result};
