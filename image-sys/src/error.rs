// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for system-level operations
#[derive(Error, Debug)]
pub enum SysError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("required tool '{0}' is not installed")]
    ToolMissing(String),

    #[error("command failed: {command}; stderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to parse {what} output: {reason}")]
    Parse { what: String, reason: String },

    #[error("failed to mount {device} at {target:?} ({fs_type}): {errno}")]
    Mount {
        device: String,
        target: PathBuf,
        fs_type: String,
        errno: nix::errno::Errno,
    },

    #[error("failed to unmount {target:?}: {errno}")]
    Unmount {
        target: PathBuf,
        errno: nix::errno::Errno,
    },

    #[error("failed to read {path:?}: {error}")]
    DeviceRead {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("invalid data on {path:?}: {reason}")]
    InvalidData { path: PathBuf, reason: String },
}

/// Result type alias for system operations
pub type Result<T> = std::result::Result<T, SysError>;
