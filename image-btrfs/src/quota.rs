// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use image_sys::run_capture;

use crate::error::Result;

/// Enable quota accounting on the filesystem mounted at `mount_point`
pub fn enable_quota(mount_point: &Path) -> Result<()> {
    let mount_point = mount_point.to_string_lossy();
    run_capture("btrfs", &["quota", "enable", &mount_point])?;
    tracing::info!(mount_point = %mount_point, "enabled btrfs quotas");
    Ok(())
}

/// Arguments for `btrfs qgroup limit`
pub fn qgroup_limit_args(limit_bytes: u64, exclusive: bool, subvolume: &Path) -> Vec<String> {
    let mut args = vec!["qgroup".to_string(), "limit".to_string()];
    if exclusive {
        args.push("-e".to_string());
    }
    args.push(limit_bytes.to_string());
    args.push(subvolume.to_string_lossy().into_owned());
    args
}

/// Limit the referenced (or, with `exclusive`, exclusive) size of a subvolume
pub fn limit_qgroup(
    mount_point: &Path,
    subvolume: &str,
    limit_bytes: u64,
    exclusive: bool,
) -> Result<()> {
    let target = mount_point.join(subvolume);
    let args = qgroup_limit_args(limit_bytes, exclusive, &target);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    run_capture("btrfs", &args)?;
    tracing::info!(subvolume, limit_bytes, exclusive, "applied qgroup limit");
    Ok(())
}
