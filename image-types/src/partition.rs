// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

/// EFI System Partition type GUID
pub const EFI_SYSTEM_PARTITION_TYPE: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

/// BIOS boot partition type GUID (GRUB core image on GPT)
pub const BIOS_BOOT_PARTITION_TYPE: &str = "21686148-6449-6e6f-744e-656564454649";

/// Generic Linux filesystem data partition type GUID
pub const LINUX_FILESYSTEM_PARTITION_TYPE: &str = "0fc63daf-8483-4772-8e79-3d69d8477de4";

/// Linux swap partition type GUID
pub const LINUX_SWAP_PARTITION_TYPE: &str = "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f";

/// Partition table type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    #[default]
    Gpt,
    Dos,
}

impl PartitionTableType {
    /// Parse the label reported by `sfdisk --json`
    pub fn parse(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "gpt" => Some(Self::Gpt),
            "dos" | "mbr" => Some(Self::Dos),
            _ => None,
        }
    }

    pub fn as_sfdisk_str(&self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Dos => "dos",
        }
    }
}

/// One partition as read from a live partition table and probed for its filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition number, starting at 1
    pub index: u32,

    /// Block device node (e.g., "/dev/loop0p2")
    pub device_path: String,

    /// PARTUUID
    pub part_uuid: String,

    /// Partition type GUID (or MBR type byte for dos tables)
    pub type_guid: String,

    /// GPT partition name (PARTLABEL)
    pub part_label: String,

    /// Offset of the partition from the start of the disk
    pub start_bytes: u64,

    pub size_bytes: u64,

    /// Probed filesystem type; empty when the partition is unformatted
    pub fs_type: String,

    /// Filesystem UUID
    pub fs_uuid: String,

    /// Filesystem LABEL
    pub fs_label: String,
}

impl Partition {
    pub fn has_filesystem(&self) -> bool {
        !self.fs_type.is_empty()
    }

    pub fn is_type(&self, type_guid: &str) -> bool {
        self.type_guid.eq_ignore_ascii_case(type_guid)
    }
}

/// Build the device node of partition `number` on `disk`.
///
/// Disks whose name ends in a digit (loop, nvme, mmcblk) use a `p` separator.
pub fn partition_device_path(disk: &str, number: u32) -> String {
    if disk.ends_with(|character: char| character.is_ascii_digit()) {
        format!("{disk}p{number}")
    } else {
        format!("{disk}{number}")
    }
}

/// Extract the partition number from a partition node of `disk`
pub fn partition_number(disk: &str, node: &str) -> Option<u32> {
    let suffix = node.strip_prefix(disk)?;
    let digits = if disk.ends_with(|character: char| character.is_ascii_digit()) {
        suffix.strip_prefix('p')?
    } else {
        suffix
    };

    if digits.is_empty() || !digits.chars().all(|character| character.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

/// How the image boots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    Efi,
    Legacy,
}

/// Find the single ESP or BIOS boot partition of an image
pub fn find_system_boot_partition(partitions: &[Partition]) -> Result<&Partition> {
    let mut boot_partitions = partitions.iter().filter(|partition| {
        partition.is_type(EFI_SYSTEM_PARTITION_TYPE) || partition.is_type(BIOS_BOOT_PARTITION_TYPE)
    });

    let first = boot_partitions.next().ok_or_else(|| {
        TypesError::SystemBootPartition(
            "no ESP or BIOS boot partition found".to_string(),
        )
    })?;

    if let Some(second) = boot_partitions.next() {
        return Err(TypesError::SystemBootPartition(format!(
            "found more than one ({} and {})",
            first.device_path, second.device_path
        )));
    }

    Ok(first)
}

/// Determine the boot type from the system boot partition's type GUID
pub fn detect_boot_type(partitions: &[Partition]) -> Result<BootType> {
    let boot_partition = find_system_boot_partition(partitions)?;
    if boot_partition.is_type(EFI_SYSTEM_PARTITION_TYPE) {
        Ok(BootType::Efi)
    } else {
        Ok(BootType::Legacy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(index: u32, type_guid: &str) -> Partition {
        Partition {
            index,
            device_path: partition_device_path("/dev/loop0", index),
            type_guid: type_guid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn names_partition_nodes_by_disk_suffix() {
        assert_eq!(partition_device_path("/dev/loop3", 2), "/dev/loop3p2");
        assert_eq!(partition_device_path("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
        assert_eq!(partition_device_path("/dev/sda", 4), "/dev/sda4");
    }

    #[test]
    fn extracts_partition_numbers() {
        assert_eq!(partition_number("/dev/loop0", "/dev/loop0p12"), Some(12));
        assert_eq!(partition_number("/dev/sda", "/dev/sda3"), Some(3));
        assert_eq!(partition_number("/dev/loop0", "/dev/loop0"), None);
        assert_eq!(partition_number("/dev/loop0", "/dev/loop1p1"), None);
        assert_eq!(partition_number("/dev/loop0", "/dev/loop0px"), None);
    }

    #[test]
    fn detects_boot_type_case_insensitively() {
        let partitions = vec![
            partition(1, "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"),
            partition(2, LINUX_FILESYSTEM_PARTITION_TYPE),
        ];
        assert_eq!(detect_boot_type(&partitions).unwrap(), BootType::Efi);

        let legacy = vec![partition(1, BIOS_BOOT_PARTITION_TYPE)];
        assert_eq!(detect_boot_type(&legacy).unwrap(), BootType::Legacy);
    }

    #[test]
    fn rejects_ambiguous_boot_partitions() {
        let none = vec![partition(1, LINUX_FILESYSTEM_PARTITION_TYPE)];
        assert!(find_system_boot_partition(&none).is_err());

        let two = vec![
            partition(1, EFI_SYSTEM_PARTITION_TYPE),
            partition(2, BIOS_BOOT_PARTITION_TYPE),
        ];
        assert!(find_system_boot_partition(&two).is_err());
    }
}
