// SPDX-License-Identifier: GPL-3.0-only

use crate::cmd::run_capture;
use crate::error::Result;

/// Command line that creates a `fs_type` filesystem on `device`
pub fn mkfs_command(fs_type: &str, device: &str) -> (&'static str, Vec<String>) {
    match fs_type {
        "swap" => ("mkswap", vec![device.to_string()]),
        "vfat" | "fat32" => (
            "mkfs",
            vec!["-t".into(), "vfat".into(), device.to_string()],
        ),
        "fat16" => (
            "mkfs",
            vec![
                "-t".into(),
                "vfat".into(),
                "-F".into(),
                "16".into(),
                device.to_string(),
            ],
        ),
        other => (
            "mkfs",
            vec!["-t".into(), other.to_string(), device.to_string()],
        ),
    }
}

pub fn format_filesystem(device: &str, fs_type: &str) -> Result<()> {
    let (command, args) = mkfs_command(fs_type, device);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    tracing::info!(device, fs_type, "creating filesystem");
    run_capture(command, &args)?;
    Ok(())
}
