// SPDX-License-Identifier: GPL-3.0-only

use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{Result, SysError};

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

fn quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// The invocation as it would be typed in a shell, for logs and errors
pub fn command_line(command: &str, args: &[&str]) -> String {
    std::iter::once(command)
        .chain(args.iter().copied())
        .map(quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fail with `ToolMissing` unless `command` is on `PATH`
pub fn require_tool(command: &str) -> Result<()> {
    which::which(command)
        .map(|_| ())
        .map_err(|_| SysError::ToolMissing(command.to_string()))
}

/// Run a command, returning its outcome whatever the exit status
pub fn run(command: &str, args: &[&str]) -> Result<CommandOutcome> {
    require_tool(command)?;
    let rendered = command_line(command, args);
    tracing::debug!(command = %rendered, "running");

    let output = Command::new(command)
        .args(args)
        .output()
        .map_err(|error| SysError::CommandFailed {
            command: rendered.clone(),
            stderr: error.to_string(),
        })?;

    Ok(CommandOutcome {
        command: rendered,
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a command and return its stdout, failing on a non-zero exit
pub fn run_capture(command: &str, args: &[&str]) -> Result<String> {
    let outcome = run(command, args)?;
    if !outcome.success() {
        return Err(SysError::CommandFailed {
            command: outcome.command,
            stderr: outcome.stderr,
        });
    }

    Ok(outcome.stdout)
}

/// Run a command with `input` written to its stdin
pub fn run_with_stdin(command: &str, args: &[&str], input: &str) -> Result<String> {
    require_tool(command)?;
    let rendered = command_line(command, args);
    tracing::debug!(command = %rendered, "running with script on stdin");

    let spawn_failed = |error: std::io::Error| SysError::CommandFailed {
        command: rendered.clone(),
        stderr: error.to_string(),
    };

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_failed)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).map_err(spawn_failed)?;
    }

    let output = child.wait_with_output().map_err(spawn_failed)?;
    if !output.status.success() {
        return Err(SysError::CommandFailed {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
