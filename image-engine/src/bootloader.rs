// SPDX-License-Identifier: GPL-3.0-only

//! Kernel command line lookup through the boot chain
//!
//! The system boot partition either carries a unified kernel image under
//! `EFI/Linux`, or a stub `grub.cfg` whose `search -n -u <uuid> -s` line names
//! the partition holding the real `grub2/grub.cfg`.

use std::fs;
use std::path::{Path, PathBuf};

use image_types::{Partition, find_system_boot_partition};

use crate::backend::FilesystemOps;
use crate::error::{EngineError, Result};
use crate::rootfs::{kernel_cmdline_from_grub_cfg, read_only_request};

const UKI_DIR: &str = "EFI/Linux";
const ESP_GRUB_CFG: &str = "boot/grub2/grub.cfg";
const BOOT_GRUB_CFG: &str = "grub2/grub.cfg";

/// What the system boot partition points at
#[derive(Debug, Clone, PartialEq, Eq)]
enum EspContents {
    UkiCmdline(String),
    BootPartition(String),
    Nothing,
}

/// Filesystem UUID named by the first `search -n -u <uuid> -s` line
pub fn boot_partition_uuid(grub_cfg: &str) -> Option<&str> {
    grub_cfg.lines().find_map(|line| {
        let uuid = line.trim().strip_prefix("search -n -u ")?.strip_suffix(" -s")?;
        uuid.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
            .then_some(uuid)
            .filter(|uuid| !uuid.is_empty())
    })
}

fn first_uki(esp_root: &Path) -> Option<PathBuf> {
    let mut images: Vec<_> = fs::read_dir(esp_root.join(UKI_DIR))
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("vmlinuz-") && name.ends_with(".efi"))
        })
        .collect();
    images.sort();
    images.into_iter().next()
}

fn read_esp(esp_root: &Path) -> Result<EspContents> {
    if let Some(uki) = first_uki(esp_root) {
        tracing::debug!(uki = %uki.display(), "reading UKI command line");
        return Ok(EspContents::UkiCmdline(image_sys::uki::read_cmdline(&uki)?));
    }

    let grub_cfg = esp_root.join(ESP_GRUB_CFG);
    let Ok(text) = fs::read_to_string(&grub_cfg) else {
        return Ok(EspContents::Nothing);
    };
    Ok(boot_partition_uuid(&text)
        .map(|uuid| EspContents::BootPartition(uuid.to_string()))
        .unwrap_or(EspContents::Nothing))
}

/// Kernel command line the image's bootloader passes, if the boot chain has one.
///
/// A UKI on the system boot partition wins; otherwise its `grub.cfg` is
/// followed to the boot partition and the first `linux` line there is used.
/// `scratch` must be an empty directory; partitions are mounted read-only.
pub fn read_boot_cmdline<B: FilesystemOps + ?Sized>(
    backend: &B,
    partitions: &[Partition],
    scratch: &Path,
) -> Result<Option<String>> {
    let _span = tracing::debug_span!("read_boot_cmdline").entered();

    let esp = match find_system_boot_partition(partitions) {
        Ok(esp) if esp.has_filesystem() => esp,
        Ok(esp) => {
            tracing::debug!(partition = %esp.device_path, "system boot partition has no filesystem");
            return Ok(None);
        }
        Err(error) => {
            tracing::debug!("no boot chain to follow: {error}");
            return Ok(None);
        }
    };

    let handle = backend.mount(&read_only_request(esp, scratch, ""))?;
    let contents = read_esp(scratch);
    handle.unmount()?;

    let uuid = match contents? {
        EspContents::UkiCmdline(cmdline) => return Ok(Some(cmdline)),
        EspContents::BootPartition(uuid) => uuid,
        EspContents::Nothing => return Ok(None),
    };

    let boot = partitions
        .iter()
        .find(|partition| partition.fs_uuid == uuid)
        .ok_or_else(|| EngineError::BootPartitionNotFound { uuid: uuid.clone() })?;
    tracing::debug!(partition = %boot.device_path, "following grub.cfg to boot partition");

    let handle = backend.mount(&read_only_request(boot, scratch, ""))?;
    let grub_cfg = fs::read_to_string(scratch.join(BOOT_GRUB_CFG)).ok();
    handle.unmount()?;

    Ok(grub_cfg.as_deref().and_then(kernel_cmdline_from_grub_cfg))
}
