// SPDX-License-Identifier: GPL-3.0-only

use std::fs::File;
use std::io::Read;
use std::path::Path;

use image_types::{VERITY_SUPERBLOCK_SIZE, VeritySuperblock};

use crate::cmd::run_capture;
use crate::error::{Result, SysError};

/// Build the hash tree of `data_device` onto `hash_device`, returning the root hash
pub fn format(data_device: &str, hash_device: &str) -> Result<String> {
    tracing::info!(data_device, hash_device, "formatting verity hash device");
    let output = run_capture("veritysetup", &["format", data_device, hash_device])?;
    parse_root_hash(&output)
}

/// Extract the `Root hash:` line of `veritysetup format` output
pub fn parse_root_hash(output: &str) -> Result<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Root hash:"))
        .map(str::trim)
        .filter(|hash| !hash.is_empty() && hash.chars().all(|character| character.is_ascii_hexdigit()))
        .map(ToString::to_string)
        .ok_or_else(|| SysError::Parse {
            what: "veritysetup".to_string(),
            reason: "no root hash in output".to_string(),
        })
}

/// Read the dm-verity superblock at the start of a hash device
pub fn read_superblock(hash_device: &Path) -> Result<VeritySuperblock> {
    let read_error = |error| SysError::DeviceRead {
        path: hash_device.to_path_buf(),
        error,
    };

    let mut file = File::open(hash_device).map_err(read_error)?;
    let mut buffer = [0u8; VERITY_SUPERBLOCK_SIZE];
    file.read_exact(&mut buffer).map_err(read_error)?;

    VeritySuperblock::parse(&buffer).map_err(|error| SysError::InvalidData {
        path: hash_device.to_path_buf(),
        reason: error.to_string(),
    })
}
