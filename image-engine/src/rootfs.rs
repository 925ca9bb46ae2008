// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::Path;

use serde::Serialize;

use image_sys::MountRequest;
use image_types::{FstabEntry, MountFlag, MountFlags, Partition, parse_fstab};

use crate::backend::{FilesystemOps, MountHandle, SubvolumeOps};
use crate::error::{EngineError, Result};

const FSTAB_PATH: &str = "etc/fstab";

/// Kernel command line sources inside a root filesystem, in lookup order
const CMDLINE_PATHS: [&str; 3] = ["etc/kernel/cmdline", "boot/grub2/grub.cfg", "boot/grub/grub.cfg"];

// Filesystem types that can never hold a root filesystem.
const NON_ROOTFS_TYPES: [&str; 5] = [
    "swap",
    "DM_verity_hash",
    "crypto_LUKS",
    "LVM2_member",
    "linux_raid_member",
];

/// Top-level subvolume of every btrfs filesystem
const BTRFS_TOP_LEVEL: &str = "subvolid=5";

/// Where an image's `/etc/fstab` lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootfsLocation {
    pub partition: Partition,
    /// Empty when the fstab sits at the top level of the filesystem
    pub subvolume: String,
}

impl RootfsLocation {
    fn mount_data(&self) -> String {
        if self.subvolume.is_empty() {
            String::new()
        } else {
            format!("subvol={}", self.subvolume)
        }
    }
}

/// Files read from a located root filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsContents {
    pub fstab: Vec<FstabEntry>,
    /// Kernel command line found in the image, if any
    pub kernel_cmdline: Option<String>,
}

pub(crate) fn read_only_request<'a>(partition: &'a Partition, target: &'a Path, data: &'a str) -> MountRequest<'a> {
    MountRequest {
        device: &partition.device_path,
        target,
        fs_type: &partition.fs_type,
        flags: MountFlags::from(MountFlag::ReadOnly),
        data,
    }
}

fn has_fstab(root: &Path) -> bool {
    root.join(FSTAB_PATH).is_file()
}

fn is_candidate(partition: &Partition) -> bool {
    partition.has_filesystem() && !NON_ROOTFS_TYPES.contains(&partition.fs_type.as_str())
}

/// Find the partition (and btrfs subvolume) holding `/etc/fstab`.
///
/// Candidates are mounted read-only at `scratch` one at a time. The first
/// match wins; a candidate that fails to mount is logged and skipped.
pub fn locate_rootfs<B: FilesystemOps + SubvolumeOps + ?Sized>(
    backend: &B,
    partitions: &[Partition],
    scratch: &Path,
) -> Result<RootfsLocation> {
    let _span = tracing::debug_span!("locate_rootfs", scratch = %scratch.display()).entered();
    let mut scanned = Vec::new();

    for partition in partitions.iter().filter(|partition| is_candidate(partition)) {
        scanned.push(partition.device_path.as_str());

        let found = if partition.fs_type == "btrfs" {
            scan_btrfs(backend, partition, scratch)?
        } else {
            scan_plain(backend, partition, scratch)?
        };

        if let Some(subvolume) = found {
            tracing::info!(
                partition = %partition.device_path,
                subvolume = %subvolume,
                "found root filesystem"
            );
            return Ok(RootfsLocation {
                partition: partition.clone(),
                subvolume,
            });
        }
    }

    Err(EngineError::RootfsNotFound {
        scanned: if scanned.is_empty() {
            "no mountable partitions".to_string()
        } else {
            scanned.join(", ")
        },
    })
}

fn try_mount<B: FilesystemOps + ?Sized>(
    backend: &B,
    request: &MountRequest<'_>,
) -> Option<Box<dyn MountHandle>> {
    match backend.mount(request) {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::warn!(device = request.device, "skipping rootfs candidate: {error}");
            None
        }
    }
}

fn scan_plain<B: FilesystemOps + ?Sized>(
    backend: &B,
    partition: &Partition,
    scratch: &Path,
) -> Result<Option<String>> {
    let Some(handle) = try_mount(backend, &read_only_request(partition, scratch, "")) else {
        return Ok(None);
    };

    let found = has_fstab(scratch);
    handle.unmount()?;

    if !found {
        tracing::debug!(partition = %partition.device_path, "no /etc/fstab");
    }
    Ok(found.then(String::new))
}

fn scan_btrfs<B: FilesystemOps + SubvolumeOps + ?Sized>(
    backend: &B,
    partition: &Partition,
    scratch: &Path,
) -> Result<Option<String>> {
    let request = read_only_request(partition, scratch, BTRFS_TOP_LEVEL);
    let Some(handle) = try_mount(backend, &request) else {
        return Ok(None);
    };

    if has_fstab(scratch) {
        handle.unmount()?;
        return Ok(Some(String::new()));
    }

    let subvolumes = backend.list_subvolumes(scratch);
    handle.unmount()?;
    let subvolumes = subvolumes?;
    tracing::debug!(partition = %partition.device_path, ?subvolumes, "probing subvolumes");

    for subvolume in subvolumes {
        let data = format!("subvol={subvolume}");
        let Some(handle) = try_mount(backend, &read_only_request(partition, scratch, &data)) else {
            continue;
        };

        let found = has_fstab(scratch);
        handle.unmount()?;
        if found {
            return Ok(Some(subvolume));
        }
    }

    Ok(None)
}

/// Read `/etc/fstab` and the kernel command line from a located root filesystem
pub fn read_rootfs<B: FilesystemOps + ?Sized>(
    backend: &B,
    location: &RootfsLocation,
    scratch: &Path,
) -> Result<RootfsContents> {
    let data = location.mount_data();
    let handle = backend.mount(&read_only_request(&location.partition, scratch, &data))?;

    let contents = read_rootfs_files(scratch);
    handle.unmount()?;
    contents
}

fn read_rootfs_files(root: &Path) -> Result<RootfsContents> {
    let fstab_path = root.join(FSTAB_PATH);
    let text = fs::read_to_string(&fstab_path).map_err(EngineError::io(&fstab_path))?;
    let fstab = parse_fstab(&text)?;

    let kernel_cmdline = CMDLINE_PATHS.iter().find_map(|relative| {
        let text = fs::read_to_string(root.join(relative)).ok()?;
        if relative.ends_with("grub.cfg") {
            kernel_cmdline_from_grub_cfg(&text)
        } else {
            Some(text.trim().to_string()).filter(|line| !line.is_empty())
        }
    });

    Ok(RootfsContents {
        fstab,
        kernel_cmdline,
    })
}

/// Arguments of the first `linux` command in a grub.cfg
pub fn kernel_cmdline_from_grub_cfg(grub_cfg: &str) -> Option<String> {
    grub_cfg.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("linux" | "linuxefi" | "linux16") => {
                // skip the kernel image path
                words.next()?;
                Some(words.collect::<Vec<_>>().join(" "))
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_arguments_of_first_linux_line() {
        let grub_cfg = "\
set timeout=0
menuentry 'Linux' {
    search --no-floppy --set=root --fs-uuid 1234
    linux /vmlinuz-6.6 root=/dev/mapper/root ro rd.systemd.verity=1 roothash=abcd
    initrd /initramfs-6.6.img
}
menuentry 'Rescue' {
    linux /vmlinuz-rescue root=UUID=1234
}
";
        assert_eq!(
            kernel_cmdline_from_grub_cfg(grub_cfg).as_deref(),
            Some("root=/dev/mapper/root ro rd.systemd.verity=1 roothash=abcd")
        );
        assert_eq!(kernel_cmdline_from_grub_cfg("set timeout=0\n"), None);
    }

    #[test]
    fn skips_unmountable_types() {
        let partition = |fs_type: &str| Partition {
            fs_type: fs_type.to_string(),
            ..Default::default()
        };
        assert!(is_candidate(&partition("ext4")));
        assert!(is_candidate(&partition("btrfs")));
        assert!(!is_candidate(&partition("")));
        assert!(!is_candidate(&partition("swap")));
        assert!(!is_candidate(&partition("DM_verity_hash")));
    }
}
