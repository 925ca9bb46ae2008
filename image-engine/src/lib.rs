// SPDX-License-Identifier: GPL-3.0-only

//! Partition and mount resolution for disk image customization
//!
//! Given an attached block device, the engine reads its partition table,
//! finds the partition holding `/etc/fstab`, resolves every fstab source to a
//! concrete partition (including a dm-verity root) and produces an ordered,
//! chroot-ready mount plan. The inverse path allocates partitions from a
//! declared layout, creates filesystems and btrfs subvolumes, and writes a
//! matching fstab.
//!
//! All device access goes through the traits in [`backend`]; [`HostBackend`]
//! runs them against the host.

pub mod allocator;
pub mod backend;
pub mod bootloader;
pub mod chroot;
pub mod config;
pub mod error;
pub mod plan;
pub mod resolve;
pub mod rootfs;
pub mod session;
pub mod subvolumes;
pub mod table;
pub mod verity;

pub use allocator::{
    AllocatedPartition, PartitionIdMap, allocate_partitions, format_filesystems,
    partition_requests, synthesize_fstab,
};
pub use backend::{
    AttachedDevice, Backend, FilesystemOps, HostBackend, LoopOps, MountHandle, PartitionOps,
    SubvolumeOps,
};
pub use bootloader::{boot_partition_uuid, read_boot_cmdline};
pub use chroot::{ChrootMounts, chroot_path};
pub use config::{EngineConfig, load_layout};
pub use error::{EngineError, Result};
pub use plan::{PlanOptions, build_mount_plan, default_mounts, sort_by_target};
pub use resolve::{ResolveFailure, find_partition, resolve_source, root_mount_id_type};
pub use rootfs::{RootfsContents, RootfsLocation, kernel_cmdline_from_grub_cfg, locate_rootfs, read_rootfs};
pub use session::{
    CreatedImage, ImageConnection, ImageInspection, connect_image, create_image, create_on_device,
    inspect_device,
};
pub use subvolumes::create_subvolumes;
pub use table::{PartitionTable, read_partition_table, read_partitions};
pub use verity::{
    KernelArg, VeritySource, discover_verity, find_kernel_arg, kernel_cmdline_args,
    layout_partitions, metadata_from_layout, parse_kernel_cmdline, verify_hash_partition,
    verity_root_entries,
};
