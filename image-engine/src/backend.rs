// SPDX-License-Identifier: GPL-3.0-only

//! Host operations the engine drives
//!
//! Every step that touches a block device goes through one of these traits so
//! the resolution logic can run against [`HostBackend`] in production and
//! against in-memory doubles in tests.

use std::path::Path;

use image_sys::{FilesystemProbe, Loopback, MountGuard, MountRequest, RawPartitionTable};
use image_types::VeritySuperblock;

/// Partition table access and filesystem probing
pub trait PartitionOps {
    fn read_table(&self, device: &str) -> image_sys::Result<RawPartitionTable>;

    /// Probe one partition node; an empty `fs_type` means no filesystem
    fn probe(&self, device: &str) -> image_sys::Result<FilesystemProbe>;

    /// Replace the partition table of `device` with the one described by an sfdisk script
    fn write_table(&self, device: &str, script: &str) -> image_sys::Result<()>;
}

/// Mounting and filesystem creation
pub trait FilesystemOps {
    fn mount(&self, request: &MountRequest<'_>) -> image_sys::Result<Box<dyn MountHandle>>;

    fn format(&self, device: &str, fs_type: &str) -> image_sys::Result<()>;

    /// Build a verity hash tree and return its root hash
    fn format_verity(&self, data_device: &str, hash_device: &str) -> image_sys::Result<String>;

    fn read_verity_superblock(&self, hash_device: &str) -> image_sys::Result<VeritySuperblock>;
}

/// Btrfs subvolume primitives, all relative to a mounted top level
pub trait SubvolumeOps {
    fn list_subvolumes(&self, mount_point: &Path) -> image_btrfs::Result<Vec<String>>;

    fn create_subvolume(&self, mount_point: &Path, path: &str) -> image_btrfs::Result<()>;

    fn enable_quota(&self, mount_point: &Path) -> image_btrfs::Result<()>;

    fn limit_qgroup(
        &self,
        mount_point: &Path,
        path: &str,
        limit_bytes: u64,
        exclusive: bool,
    ) -> image_btrfs::Result<()>;
}

/// Image file attachment
pub trait LoopOps {
    fn attach(&self, image: &Path) -> image_sys::Result<Box<dyn AttachedDevice>>;
}

/// An attached block device; released on drop if not detached explicitly
pub trait AttachedDevice {
    fn device_path(&self) -> &str;

    fn detach(self: Box<Self>) -> image_sys::Result<()>;
}

/// A live mount; unmounted on drop if not unmounted explicitly
pub trait MountHandle {
    fn target(&self) -> &Path;

    fn unmount(self: Box<Self>) -> image_sys::Result<()>;
}

/// Everything an image session needs
pub trait Backend: PartitionOps + FilesystemOps + SubvolumeOps + LoopOps {}

impl<T: PartitionOps + FilesystemOps + SubvolumeOps + LoopOps + ?Sized> Backend for T {}

/// Runs every operation against the host through `image-sys` and `image-btrfs`
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl PartitionOps for HostBackend {
    fn read_table(&self, device: &str) -> image_sys::Result<RawPartitionTable> {
        image_sys::read_partition_table(device)
    }

    fn probe(&self, device: &str) -> image_sys::Result<FilesystemProbe> {
        image_sys::probe_filesystem(device)
    }

    fn write_table(&self, device: &str, script: &str) -> image_sys::Result<()> {
        image_sys::write_partition_table(device, script)
    }
}

impl FilesystemOps for HostBackend {
    fn mount(&self, request: &MountRequest<'_>) -> image_sys::Result<Box<dyn MountHandle>> {
        Ok(Box::new(image_sys::mount(request)?))
    }

    fn format(&self, device: &str, fs_type: &str) -> image_sys::Result<()> {
        image_sys::format_filesystem(device, fs_type)
    }

    fn format_verity(&self, data_device: &str, hash_device: &str) -> image_sys::Result<String> {
        image_sys::veritysetup::format(data_device, hash_device)
    }

    fn read_verity_superblock(&self, hash_device: &str) -> image_sys::Result<VeritySuperblock> {
        image_sys::veritysetup::read_superblock(Path::new(hash_device))
    }
}

impl SubvolumeOps for HostBackend {
    fn list_subvolumes(&self, mount_point: &Path) -> image_btrfs::Result<Vec<String>> {
        image_btrfs::SubvolumeManager::new(mount_point)?.list_paths()
    }

    fn create_subvolume(&self, mount_point: &Path, path: &str) -> image_btrfs::Result<()> {
        image_btrfs::SubvolumeManager::new(mount_point)?.create(path)
    }

    fn enable_quota(&self, mount_point: &Path) -> image_btrfs::Result<()> {
        image_btrfs::enable_quota(mount_point)
    }

    fn limit_qgroup(
        &self,
        mount_point: &Path,
        path: &str,
        limit_bytes: u64,
        exclusive: bool,
    ) -> image_btrfs::Result<()> {
        image_btrfs::limit_qgroup(mount_point, path, limit_bytes, exclusive)
    }
}

impl LoopOps for HostBackend {
    fn attach(&self, image: &Path) -> image_sys::Result<Box<dyn AttachedDevice>> {
        Ok(Box::new(Loopback::attach(image)?))
    }
}

impl AttachedDevice for Loopback {
    fn device_path(&self) -> &str {
        Loopback::device_path(self)
    }

    fn detach(self: Box<Self>) -> image_sys::Result<()> {
        Loopback::detach(*self)
    }
}

impl MountHandle for MountGuard {
    fn target(&self) -> &Path {
        MountGuard::target(self)
    }

    fn unmount(self: Box<Self>) -> image_sys::Result<()> {
        MountGuard::unmount(*self)
    }
}
