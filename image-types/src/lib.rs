// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the disk image mount engine
//!
//! These types are shared by every layer of the stack:
//!
//! - **image-sys**: fills `Partition` from live partition tables and executes `MountSpec`s
//! - **image-btrfs**: consumes `BtrfsSubvolumeConfig` when creating subvolumes
//! - **image-engine**: turns fstab entries and partitions into mount plans
//!
//! Parsing that needs no I/O (fstab text, source identifiers, mount options, verity
//! superblocks, disk layouts) lives here so it can be tested without a block device.

pub mod btrfs;
pub mod common;
pub mod error;
pub mod fstab;
pub mod layout;
pub mod mount;
pub mod partition;
pub mod source;
pub mod verity;

pub use btrfs::{
    BtrfsConfig, BtrfsQuota, BtrfsSubvolumeConfig, FS_TREE_PREFIX, strip_fs_tree_prefix,
    validate_subvolume_path,
};
pub use common::{DiskSize, PARTITION_ALIGNMENT_BYTES, PartitionExtent, is_aligned, require_aligned};
pub use error::{Result, TypesError};
pub use fstab::{FstabEntry, PSEUDO_FILESYSTEMS, parse_fstab, render_fstab};
pub use layout::{DiskLayout, FilesystemDecl, PartitionDecl, VerityConfig};
pub use mount::{MountFlag, MountFlags, MountSpec, ParsedMountOptions, parse_mount_options};
pub use partition::{
    BIOS_BOOT_PARTITION_TYPE, BootType, EFI_SYSTEM_PARTITION_TYPE,
    LINUX_FILESYSTEM_PARTITION_TYPE, LINUX_SWAP_PARTITION_TYPE, Partition, PartitionTableType,
    detect_boot_type, find_system_boot_partition, partition_device_path, partition_number,
};
pub use source::{
    DEVICE_MAPPER_PATH, ExtendedSourceSpec, MountIdType, VERITY_ROOT_DEVICE_NAME,
    VERITY_ROOT_DEVICE_PATH, VERITY_USR_DEVICE_NAME, root_mount_id_type, verity_device_path,
};
pub use verity::{
    CorruptionOption, VERITY_SUPERBLOCK_SIZE, VerityDeviceMetadata, VerityOptions,
    VeritySuperblock, hash_tree_size_bytes,
};
