// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for disk image handling
//!
//! This crate wraps the host tools and syscalls the engine needs:
//! - Partition table dumps and scripted writes (sfdisk)
//! - Filesystem probing (blkid) and creation (mkfs, mkswap)
//! - Loop device attachment (losetup)
//! - `mount(2)` / `umount2(2)` via nix
//! - dm-verity hash tree formatting and superblock reads (veritysetup)
//! - Kernel command lines embedded in unified kernel images
//!
//! Almost everything here requires root and operates on real block devices.

pub mod blkid;
pub mod cmd;
pub mod error;
pub mod loopback;
pub mod mkfs;
pub mod mount;
pub mod sfdisk;
pub mod uki;
pub mod veritysetup;

pub use blkid::{FilesystemProbe, parse_blkid_export, probe_filesystem};
pub use cmd::{CommandOutcome, command_line, require_tool, run, run_capture, run_with_stdin};
pub use error::{Result, SysError};
pub use loopback::Loopback;
pub use mkfs::{format_filesystem, mkfs_command};
pub use mount::{MountGuard, MountRequest, mount, to_ms_flags, unmount_path};
pub use sfdisk::{
    PartitionRequest, RawPartition, RawPartitionTable, build_script, escape_name,
    parse_sfdisk_dump, read_partition_table, refresh_partitions, write_partition_table,
};
