// SPDX-License-Identifier: GPL-3.0-only

//! Declarative disk layout for new images, loaded from TOML

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::btrfs::BtrfsConfig;
use crate::common::{DiskSize, PartitionExtent, require_aligned};
use crate::error::{Result, TypesError};
use crate::partition::{
    BIOS_BOOT_PARTITION_TYPE, EFI_SYSTEM_PARTITION_TYPE, LINUX_FILESYSTEM_PARTITION_TYPE,
    LINUX_SWAP_PARTITION_TYPE, PartitionTableType,
};
use crate::source::{MountIdType, VERITY_ROOT_DEVICE_NAME};
use crate::verity::CorruptionOption;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLayout {
    #[serde(default)]
    pub partition_table: PartitionTableType,
    pub max_size: DiskSize,
    pub partitions: Vec<PartitionDecl>,
    #[serde(default)]
    pub filesystems: Vec<FilesystemDecl>,
    #[serde(default)]
    pub verity: Option<VerityConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDecl {
    pub id: String,
    pub start: DiskSize,
    /// Exclusive end; `None` extends to the end of the disk
    #[serde(default)]
    pub end: Option<DiskSize>,
    /// `esp`, `bios-grub`, `linux`, `swap`, or a raw type GUID
    #[serde(rename = "type", default = "default_partition_kind")]
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_partition_kind() -> String {
    "linux".to_string()
}

impl PartitionDecl {
    pub fn end_bytes(&self, disk_size: u64) -> u64 {
        self.end.map(DiskSize::bytes).unwrap_or(disk_size)
    }

    pub fn extent(&self, disk_size: u64) -> PartitionExtent {
        PartitionExtent {
            start: self.start.bytes(),
            end: self.end_bytes(disk_size),
        }
    }

    /// Type value written to the partition table
    pub fn type_id(&self, table: PartitionTableType) -> Result<String> {
        let resolved = match (table, self.kind.as_str()) {
            (PartitionTableType::Gpt, "esp") => EFI_SYSTEM_PARTITION_TYPE,
            (PartitionTableType::Gpt, "bios-grub") => BIOS_BOOT_PARTITION_TYPE,
            (PartitionTableType::Gpt, "linux") => LINUX_FILESYSTEM_PARTITION_TYPE,
            (PartitionTableType::Gpt, "swap") => LINUX_SWAP_PARTITION_TYPE,
            (PartitionTableType::Dos, "esp") => "ef",
            (PartitionTableType::Dos, "linux") => "83",
            (PartitionTableType::Dos, "swap") => "82",
            (PartitionTableType::Dos, "bios-grub") => {
                return Err(TypesError::LayoutInvalid(format!(
                    "partition '{}': bios-grub requires a gpt partition table",
                    self.id
                )));
            }
            (_, raw) => raw,
        };

        Ok(resolved.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemDecl {
    /// Id of the partition holding this filesystem
    pub device_id: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub mount_options: Option<String>,
    #[serde(default)]
    pub mount_id_type: MountIdType,
    #[serde(default)]
    pub btrfs: Option<BtrfsConfig>,
}

impl FilesystemDecl {
    pub fn is_swap(&self) -> bool {
        self.fs_type == "swap"
    }
}

/// Verity pairing for a new image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerityConfig {
    #[serde(default = "default_verity_name")]
    pub name: String,
    /// Partition ids from `[[partitions]]`
    #[serde(default)]
    pub data_device_id: Option<String>,
    #[serde(default)]
    pub hash_device_id: Option<String>,
    /// Alternatively, partitions matched by PARTLABEL
    #[serde(default)]
    pub data_part_label: Option<String>,
    #[serde(default)]
    pub hash_part_label: Option<String>,
    #[serde(default)]
    pub data_id_type: MountIdType,
    #[serde(default)]
    pub hash_id_type: MountIdType,
    #[serde(default)]
    pub corruption_option: CorruptionOption,
    #[serde(default)]
    pub hash_signature_path: Option<String>,
}

fn default_verity_name() -> String {
    VERITY_ROOT_DEVICE_NAME.to_string()
}

impl DiskLayout {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let layout: DiskLayout =
            toml::from_str(text).map_err(|error| TypesError::LayoutParse(error.to_string()))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn partition(&self, id: &str) -> Option<&PartitionDecl> {
        self.partitions.iter().find(|partition| partition.id == id)
    }

    /// Check alignment of the disk size and every partition boundary
    pub fn validate_alignment(&self) -> Result<()> {
        require_aligned("max_size", self.max_size.bytes())?;
        for partition in &self.partitions {
            require_aligned(&format!("partition '{}' start", partition.id), partition.start.bytes())?;
            if let Some(end) = partition.end {
                require_aligned(&format!("partition '{}' end", partition.id), end.bytes())?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_alignment()?;

        if self.partitions.is_empty() {
            return Err(TypesError::LayoutInvalid(
                "at least one partition is required".to_string(),
            ));
        }

        let disk_size = self.max_size.bytes();
        let mut ids = HashSet::new();
        let mut previous: Option<PartitionExtent> = None;

        for (position, partition) in self.partitions.iter().enumerate() {
            if partition.id.is_empty() || !ids.insert(partition.id.as_str()) {
                return Err(TypesError::LayoutInvalid(format!(
                    "partition id '{}' is empty or duplicated",
                    partition.id
                )));
            }

            if partition.end.is_none() && position + 1 != self.partitions.len() {
                return Err(TypesError::LayoutInvalid(format!(
                    "partition '{}': only the last partition may omit its end",
                    partition.id
                )));
            }

            let extent = partition.extent(disk_size);
            if !extent.fits_within(disk_size) {
                return Err(TypesError::LayoutInvalid(format!(
                    "partition '{}' does not fit on a {} disk",
                    partition.id, self.max_size
                )));
            }

            if let Some(previous) = previous
                && !extent.follows(&previous)
            {
                return Err(TypesError::LayoutInvalid(format!(
                    "partition '{}' overlaps or precedes the partition before it",
                    partition.id
                )));
            }

            partition.type_id(self.partition_table)?;
            previous = Some(extent);
        }

        let mut filesystem_devices = HashSet::new();
        let mut mount_points = HashSet::new();
        for filesystem in &self.filesystems {
            if self.partition(&filesystem.device_id).is_none() {
                return Err(TypesError::LayoutInvalid(format!(
                    "filesystem references unknown partition '{}'",
                    filesystem.device_id
                )));
            }

            if !filesystem_devices.insert(filesystem.device_id.as_str()) {
                return Err(TypesError::LayoutInvalid(format!(
                    "partition '{}' has more than one filesystem",
                    filesystem.device_id
                )));
            }

            if let Some(mount_point) = &filesystem.mount_point
                && !mount_points.insert(mount_point.clone())
            {
                return Err(TypesError::LayoutInvalid(format!(
                    "mount point '{mount_point}' is used more than once"
                )));
            }

            if let Some(btrfs) = &filesystem.btrfs {
                if filesystem.fs_type != "btrfs" {
                    return Err(TypesError::LayoutInvalid(format!(
                        "partition '{}': subvolumes declared on a {} filesystem",
                        filesystem.device_id, filesystem.fs_type
                    )));
                }

                btrfs.validate()?;
                for subvolume in &btrfs.subvolumes {
                    if let Some(mount_point) = &subvolume.mount_point
                        && !mount_points.insert(mount_point.clone())
                    {
                        return Err(TypesError::LayoutInvalid(format!(
                            "mount point '{mount_point}' is used more than once"
                        )));
                    }
                }
            }
        }

        if let Some(verity) = &self.verity {
            self.validate_verity(verity)?;
        }

        Ok(())
    }

    fn validate_verity(&self, verity: &VerityConfig) -> Result<()> {
        let data = verity
            .data_device_id
            .as_deref()
            .or(verity.data_part_label.as_deref());
        let hash = verity
            .hash_device_id
            .as_deref()
            .or(verity.hash_part_label.as_deref());

        let (Some(data), Some(hash)) = (data, hash) else {
            return Err(TypesError::LayoutInvalid(
                "verity requires a data and a hash partition".to_string(),
            ));
        };

        if data == hash {
            return Err(TypesError::LayoutInvalid(format!(
                "verity data and hash partitions are both '{data}'"
            )));
        }

        for id in [&verity.data_device_id, &verity.hash_device_id].into_iter().flatten() {
            if self.partition(id).is_none() {
                return Err(TypesError::LayoutInvalid(format!(
                    "verity references unknown partition '{id}'"
                )));
            }
        }

        Ok(())
    }
}
