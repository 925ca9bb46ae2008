// SPDX-License-Identifier: GPL-3.0-only

//! Partition allocation for new images
//!
//! The declared layout is authoritative: partitions are written in declaration
//! order, so the n-th declared partition becomes partition number n, and the
//! synthetic fstab is generated from the same declaration rather than
//! discovered from disk.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use image_sys::{PartitionRequest, build_script};
use image_types::{
    DiskLayout, FilesystemDecl, FstabEntry, Partition, PartitionTableType,
    VERITY_ROOT_DEVICE_NAME, VERITY_ROOT_DEVICE_PATH, partition_device_path,
};

use crate::backend::{FilesystemOps, PartitionOps};
use crate::error::{EngineError, Result};

/// Where a declared partition ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedPartition {
    pub device_path: String,
    pub part_uuid: String,
    pub index: u32,
}

/// Declared partition id to its allocated partition
pub type PartitionIdMap = BTreeMap<String, AllocatedPartition>;

/// sfdisk requests for every declared partition, in order
pub fn partition_requests(layout: &DiskLayout) -> Result<Vec<PartitionRequest>> {
    layout
        .partitions
        .iter()
        .map(|partition| {
            Ok(PartitionRequest {
                start_bytes: partition.start.bytes(),
                // an open end takes the rest of the disk
                size_bytes: partition.end.map(|end| end.bytes() - partition.start.bytes()),
                type_id: partition.type_id(layout.partition_table)?,
                part_uuid: (layout.partition_table == PartitionTableType::Gpt)
                    .then(|| Uuid::new_v4().to_string()),
                name: partition.label.clone(),
            })
        })
        .collect()
}

/// Write the layout's partition table to `device` and map ids to partitions.
///
/// The layout is validated first; nothing is written if it is invalid.
pub fn allocate_partitions<B: PartitionOps + ?Sized>(
    backend: &B,
    device: &str,
    layout: &DiskLayout,
) -> Result<PartitionIdMap> {
    let _span = tracing::info_span!("allocate_partitions", device).entered();

    layout.validate()?;
    let requests = partition_requests(layout)?;
    let script = build_script(layout.partition_table, &requests);
    tracing::debug!(%script, "partition script");

    backend.write_table(device, &script)?;

    let table = backend
        .read_table(device)
        .map_err(|error| EngineError::PartitionTableUnreadable {
            device: device.to_string(),
            reason: error.to_string(),
        })?;

    let mut allocated = PartitionIdMap::new();
    for (position, declared) in layout.partitions.iter().enumerate() {
        let number = position as u32 + 1;
        let expected_node = partition_device_path(device, number);

        let raw = table
            .partitions
            .iter()
            .find(|raw| raw.node == expected_node)
            .ok_or_else(|| EngineError::DevicePathNotFound {
                device_id: declared.id.clone(),
            })?;

        if let Some(requested) = &requests[position].part_uuid
            && !raw.part_uuid.eq_ignore_ascii_case(requested)
        {
            tracing::warn!(
                partition = %raw.node,
                requested = %requested,
                actual = %raw.part_uuid,
                "partition UUID differs from the requested one"
            );
        }

        allocated.insert(
            declared.id.clone(),
            AllocatedPartition {
                device_path: raw.node.clone(),
                part_uuid: raw.part_uuid.clone(),
                index: number,
            },
        );
    }

    tracing::info!(count = allocated.len(), "allocated partitions");
    Ok(allocated)
}

fn allocated_device<'a>(allocated: &'a PartitionIdMap, device_id: &str) -> Result<&'a str> {
    allocated
        .get(device_id)
        .map(|partition| partition.device_path.as_str())
        .ok_or_else(|| EngineError::DevicePathNotFound {
            device_id: device_id.to_string(),
        })
}

/// Create every declared filesystem on its allocated partition
pub fn format_filesystems<B: FilesystemOps + ?Sized>(
    backend: &B,
    layout: &DiskLayout,
    allocated: &PartitionIdMap,
) -> Result<()> {
    for filesystem in &layout.filesystems {
        let device = allocated_device(allocated, &filesystem.device_id)?;
        backend.format(device, &filesystem.fs_type)?;
    }
    Ok(())
}

fn is_verity_root_filesystem(layout: &DiskLayout, filesystem: &FilesystemDecl, partition: &Partition) -> bool {
    let Some(verity) = &layout.verity else {
        return false;
    };
    if verity.name != VERITY_ROOT_DEVICE_NAME {
        return false;
    }

    verity.data_device_id.as_deref() == Some(filesystem.device_id.as_str())
        || (verity.data_device_id.is_none()
            && verity.data_part_label.as_deref() == Some(partition.part_label.as_str()))
}

fn split_options(options: Option<&str>) -> Vec<String> {
    options
        .map(|text| {
            text.split(',')
                .filter(|option| !option.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Build the fstab of a new image from its layout.
///
/// `partitions` must be probed after formatting so filesystem UUIDs are known.
/// Entries come back in mount plan order.
pub fn synthesize_fstab(
    layout: &DiskLayout,
    allocated: &PartitionIdMap,
    partitions: &[Partition],
) -> Result<Vec<FstabEntry>> {
    let mut entries = Vec::new();

    for filesystem in &layout.filesystems {
        let device = allocated_device(allocated, &filesystem.device_id)?;
        let partition = partitions
            .iter()
            .find(|partition| partition.device_path == device)
            .ok_or_else(|| EngineError::DevicePathNotFound {
                device_id: filesystem.device_id.clone(),
            })?;

        let verity_root = is_verity_root_filesystem(layout, filesystem, partition);
        let source = if verity_root {
            VERITY_ROOT_DEVICE_PATH.to_string()
        } else {
            filesystem.mount_id_type.format_source(partition)
        };

        if filesystem.is_swap() {
            let mut options = split_options(filesystem.mount_options.as_deref());
            if options.is_empty() {
                options.push("sw".to_string());
            }
            entries.push(FstabEntry {
                options,
                ..FstabEntry::new(source.clone(), "none", "swap")
            });
            continue;
        }

        if let Some(mount_point) = &filesystem.mount_point {
            let mut options = split_options(filesystem.mount_options.as_deref());
            if options.is_empty() {
                options.push("defaults".to_string());
            }
            if verity_root && !options.iter().any(|option| option == "ro") {
                options.push("ro".to_string());
            }

            entries.push(FstabEntry {
                options,
                pass: if mount_point == "/" { 1 } else { 2 },
                ..FstabEntry::new(source.clone(), mount_point.clone(), filesystem.fs_type.clone())
            });
        }

        if let Some(btrfs) = &filesystem.btrfs {
            for subvolume in &btrfs.subvolumes {
                let Some(mount_point) = &subvolume.mount_point else {
                    continue;
                };

                let mut options = vec![format!("subvol={}", subvolume.path)];
                options.extend(subvolume.options.iter().cloned());

                entries.push(FstabEntry {
                    options,
                    ..FstabEntry::new(source.clone(), mount_point.clone(), "btrfs")
                });
            }
        }
    }

    entries.sort_by(|a, b| a.target.cmp(&b.target));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_types::DiskSize;

    const LAYOUT: &str = r#"
partition_table = "gpt"
max_size = "4GiB"

[[partitions]]
id = "esp"
start = "1MiB"
end = "101MiB"
type = "esp"
label = "esp"

[[partitions]]
id = "rootfs"
start = "101MiB"
label = "root \"main\""
"#;

    #[test]
    fn requests_follow_declaration_order() {
        let layout = DiskLayout::from_toml_str(LAYOUT).unwrap();
        let requests = partition_requests(&layout).unwrap();

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].start_bytes, DiskSize::mib(1).bytes());
        assert_eq!(requests[0].size_bytes, Some(DiskSize::mib(100).bytes()));
        assert_eq!(requests[0].type_id, image_types::EFI_SYSTEM_PARTITION_TYPE);
        assert_eq!(requests[1].size_bytes, None);
        assert!(requests.iter().all(|request| request.part_uuid.is_some()));
        assert_ne!(requests[0].part_uuid, requests[1].part_uuid);

        let script = build_script(layout.partition_table, &requests);
        assert!(script.starts_with("label: gpt\nstart=1MiB, size=100MiB, type=c12a7328"));
        assert!(script.contains("name=\"root \\x22main\\x22\""));
    }
}
