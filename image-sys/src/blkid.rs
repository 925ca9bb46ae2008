// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use crate::cmd::run;
use crate::error::{Result, SysError};

// blkid exits with 2 when the device has no recognisable signature.
const BLKID_NOTHING_FOUND: i32 = 2;

/// Filesystem signature found on a block device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemProbe {
    /// Empty when no filesystem was detected
    pub fs_type: String,
    pub uuid: String,
    pub label: String,
}

/// Probe `device` directly (bypassing the blkid cache) for a filesystem
pub fn probe_filesystem(device: &str) -> Result<FilesystemProbe> {
    let outcome = run("blkid", &["--probe", "--output", "export", device])?;
    match outcome.status {
        Some(0) => Ok(parse_blkid_export(&outcome.stdout)),
        Some(BLKID_NOTHING_FOUND) => {
            tracing::debug!(device, "no filesystem signature");
            Ok(FilesystemProbe::default())
        }
        _ => Err(SysError::CommandFailed {
            command: outcome.command,
            stderr: outcome.stderr,
        }),
    }
}

/// Parse `blkid --output export` key/value lines
pub fn parse_blkid_export(output: &str) -> FilesystemProbe {
    let values: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .collect();

    let field = |key: &str| values.get(key).map(|value| value.to_string()).unwrap_or_default();

    FilesystemProbe {
        fs_type: field("TYPE"),
        uuid: field("UUID"),
        label: field("LABEL"),
    }
}
