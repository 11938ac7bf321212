// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Delegation of privileged commands.

use crate::command::CommandSpec;

/// Decides whether a command can run as-is or must be routed through an
/// escalation helper.
pub trait Privilege {
    /// Whether the current process can mount and write system paths itself.
    fn is_privileged(&self) -> bool;

    /// Rewrites `spec` so that it runs as root.
    fn escalate(&self, spec: CommandSpec) -> CommandSpec;

    /// Returns `spec` unchanged when privileged, escalated otherwise.
    fn prepare(&self, spec: CommandSpec) -> CommandSpec {
        if self.is_privileged() {
            spec
        } else {
            self.escalate(spec)
        }
    }
}

/// `sudo -n -u root -- <cmd>`; `-n` fails instead of prompting so a missing
/// sudoers rule never blocks container startup.
#[derive(Debug, Clone)]
pub struct SudoEscalator {
    program: String,
    privileged: bool,
}

impl SudoEscalator {
    /// Detects privilege from the effective uid of this process.
    pub fn detect() -> Self {
        Self {
            program: "sudo".to_string(),
            privileged: effective_uid_is_root(),
        }
    }

    pub fn with_privilege(privileged: bool) -> Self {
        Self {
            program: "sudo".to_string(),
            privileged,
        }
    }
}

impl Privilege for SudoEscalator {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn escalate(&self, spec: CommandSpec) -> CommandSpec {
        let mut escalated = CommandSpec::new(&self.program)
            .args(["-n", "-u", "root", "--"])
            .arg(spec.program)
            .args(spec.args);
        escalated.stdin = spec.stdin;
        escalated
    }
}

#[cfg(unix)]
fn effective_uid_is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn effective_uid_is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_commands_pass_through() {
        let privilege = SudoEscalator::with_privilege(true);
        let spec = CommandSpec::new("bindfs").arg("/w");
        assert_eq!(privilege.prepare(spec.clone()), spec);
    }

    #[test]
    fn unprivileged_commands_go_through_sudo() {
        let privilege = SudoEscalator::with_privilege(false);
        let spec = CommandSpec::new("tee").arg("/etc/cron.d/x").stdin("line\n");
        let prepared = privilege.prepare(spec);
        assert_eq!(
            prepared.argv(),
            vec!["sudo", "-n", "-u", "root", "--", "tee", "/etc/cron.d/x"]
        );
        assert_eq!(prepared.stdin.as_deref(), Some(&b"line\n"[..]));
    }
}
