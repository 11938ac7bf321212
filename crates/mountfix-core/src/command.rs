// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! External command execution.
//!
//! Every program mountfix shells out to (findmnt, bindfs, sudo, logger, tee)
//! goes through [`CommandRunner`] so tests can substitute a recording fake.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

/// A fully described command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program followed by its arguments, as an argv vector.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone()).chain(self.args.iter().cloned()).collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            success: false,
            status: format!("exit status: {code}"),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs commands to completion.
///
/// An `Err` means the program could not be started at all (typically
/// `NotFound`); a program that ran and failed is an `Ok` with
/// `success == false`.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        (**self).run(spec)
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        debug!(operation = "run_command", command = %spec, "running external command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn()?;
        if let Some(input) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)?;
            }
        }
        let output = child.wait_with_output()?;

        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_argv() {
        let spec = CommandSpec::new("bindfs").args(["-o", "allow_other"]).arg("/w");
        assert_eq!(spec.to_string(), "bindfs -o allow_other /w");
        assert_eq!(spec.argv().len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_reports_exit_status() {
        let ok = SystemRunner.run(&CommandSpec::new("true")).unwrap();
        assert!(ok.success);

        let failed = SystemRunner.run(&CommandSpec::new("false")).unwrap();
        assert!(!failed.success);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_feeds_stdin() {
        let out = SystemRunner.run(&CommandSpec::new("cat").stdin("hello")).unwrap();
        assert_eq!(out.stdout_lossy(), "hello");
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let err = SystemRunner
            .run(&CommandSpec::new("mountfix-definitely-not-a-program"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
