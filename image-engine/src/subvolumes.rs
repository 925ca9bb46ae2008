// SPDX-License-Identifier: GPL-3.0-only

use std::path::Path;

use image_sys::MountRequest;
use image_types::{BtrfsConfig, DiskLayout, MountFlags, Partition};

use crate::allocator::PartitionIdMap;
use crate::backend::{FilesystemOps, SubvolumeOps};
use crate::error::{EngineError, Result};

/// Create the declared subvolumes of every btrfs filesystem in `layout`.
///
/// Each filesystem's top level is mounted at `scratch` while its subvolumes
/// are created parents first, then quota limits are applied.
pub fn create_subvolumes<B: FilesystemOps + SubvolumeOps + ?Sized>(
    backend: &B,
    layout: &DiskLayout,
    allocated: &PartitionIdMap,
    partitions: &[Partition],
    scratch: &Path,
) -> Result<()> {
    for filesystem in &layout.filesystems {
        let Some(btrfs) = filesystem.btrfs.as_ref().filter(|config| !config.subvolumes.is_empty())
        else {
            continue;
        };

        let partition = btrfs_partition(&filesystem.device_id, allocated, partitions)?;
        create_on_partition(backend, partition, btrfs, scratch)?;
    }
    Ok(())
}

/// The probed partition behind `device_id`, which must hold btrfs
fn btrfs_partition<'a>(
    device_id: &str,
    allocated: &PartitionIdMap,
    partitions: &'a [Partition],
) -> Result<&'a Partition> {
    let device_path = &allocated
        .get(device_id)
        .ok_or_else(|| EngineError::DevicePathNotFound {
            device_id: device_id.to_string(),
        })?
        .device_path;

    let partition = partitions
        .iter()
        .find(|partition| partition.device_path == *device_path)
        .ok_or_else(|| EngineError::DevicePathNotFound {
            device_id: device_id.to_string(),
        })?;

    if partition.fs_type.is_empty() {
        return Err(EngineError::FsTypeNotFound {
            device: device_path.clone(),
        });
    }
    if partition.fs_type != "btrfs" {
        return Err(EngineError::NotBtrfsFilesystem {
            device: device_path.clone(),
            fs_type: partition.fs_type.clone(),
        });
    }
    Ok(partition)
}

fn create_on_partition<B: FilesystemOps + SubvolumeOps + ?Sized>(
    backend: &B,
    partition: &Partition,
    btrfs: &BtrfsConfig,
    scratch: &Path,
) -> Result<()> {
    let _span = tracing::info_span!("create_subvolumes", device = %partition.device_path).entered();

    let handle = backend.mount(&MountRequest {
        device: &partition.device_path,
        target: scratch,
        fs_type: "btrfs",
        flags: MountFlags::empty(),
        data: "subvolid=5",
    })?;

    for subvolume in btrfs.creation_order() {
        backend.create_subvolume(scratch, &subvolume.path)?;
    }

    if btrfs.has_quotas() {
        backend.enable_quota(scratch)?;

        for subvolume in &btrfs.subvolumes {
            let Some(quota) = &subvolume.quota else {
                continue;
            };
            if let Some(limit) = quota.referenced_limit {
                backend.limit_qgroup(scratch, &subvolume.path, limit.bytes(), false)?;
            }
            if let Some(limit) = quota.exclusive_limit {
                backend.limit_qgroup(scratch, &subvolume.path, limit.bytes(), true)?;
            }
        }
    }

    handle.unmount()?;
    Ok(())
}
