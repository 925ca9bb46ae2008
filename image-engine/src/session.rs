// SPDX-License-Identifier: GPL-3.0-only

//! End-to-end flows over one attached image
//!
//! [`inspect_device`] and [`connect_image`] turn an existing image into a
//! mount plan; [`create_on_device`] and [`create_image`] build a new image
//! from a declared layout. Every flow runs sequentially on a single device.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use image_types::{
    BootType, DiskLayout, FstabEntry, MountIdType, MountSpec, Partition, VerityDeviceMetadata,
    detect_boot_type, render_fstab,
};

use crate::allocator::{PartitionIdMap, allocate_partitions, format_filesystems, synthesize_fstab};
use crate::backend::{AttachedDevice, Backend};
use crate::bootloader::read_boot_cmdline;
use crate::chroot::{ChrootMounts, chroot_path};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::plan::{PlanOptions, build_mount_plan};
use crate::resolve::root_mount_id_type;
use crate::rootfs::{RootfsContents, RootfsLocation, locate_rootfs, read_rootfs};
use crate::subvolumes::create_subvolumes;
use crate::table::{PartitionTable, read_partition_table};
use crate::verity::{
    VeritySource, discover_verity, layout_partitions, metadata_from_layout, verify_hash_partition,
    verity_root_entries,
};

/// What was learned about an existing image
#[derive(Debug, Clone, Serialize)]
pub struct ImageInspection {
    pub table: PartitionTable,
    pub boot_type: Option<BootType>,
    pub rootfs: RootfsLocation,
    pub fstab: Vec<FstabEntry>,
    pub root_mount_id_type: Option<MountIdType>,
    pub verity: Option<VerityDeviceMetadata>,
    pub plan: Vec<MountSpec>,
}

/// Discover the layout of the image on `device` and build its mount plan
pub fn inspect_device<B: Backend + ?Sized>(
    backend: &B,
    device: &str,
    config: &EngineConfig,
) -> Result<ImageInspection> {
    let _span = tracing::info_span!("inspect", device).entered();

    let table = read_partition_table(backend, device)?;
    let boot_type = match detect_boot_type(&table.partitions) {
        Ok(boot_type) => Some(boot_type),
        Err(error) => {
            tracing::warn!("cannot determine boot type: {error}");
            None
        }
    };

    let scratch = config.scratch_dir("rootfs-")?;
    let rootfs = locate_rootfs(backend, &table.partitions, scratch.path())?;
    let contents = read_rootfs(backend, &rootfs, scratch.path())?;

    let cmdline = kernel_cmdline(backend, config, &table.partitions, &contents, scratch.path())?;
    let verity = discover_verity(
        &contents.fstab,
        &table.partitions,
        VeritySource::KernelCmdline(cmdline.as_deref().unwrap_or_default()),
    )?;
    if let Some(metadata) = &verity {
        verify_hash_partition(backend, metadata)?;
    }

    let root_mount_id_type = match root_mount_id_type(&contents.fstab) {
        Ok(id_type) => Some(id_type),
        Err(error) => {
            tracing::warn!("root filesystem cannot be referenced from boot configuration: {error}");
            None
        }
    };

    let plan = build_mount_plan(
        &contents.fstab,
        &table.partitions,
        verity.as_ref().map(|metadata| &metadata.data_partition),
        config.plan,
    )?;

    Ok(ImageInspection {
        table,
        boot_type,
        rootfs,
        fstab: contents.fstab,
        root_mount_id_type,
        verity,
        plan,
    })
}

/// Kernel command line naming the verity partitions.
///
/// The configured override comes first, then the boot chain, then files inside
/// the root filesystem. The boot chain is only followed when the fstab mounts a
/// verity root.
fn kernel_cmdline<B: Backend + ?Sized>(
    backend: &B,
    config: &EngineConfig,
    partitions: &[Partition],
    contents: &RootfsContents,
    scratch: &Path,
) -> Result<Option<String>> {
    if let Some(cmdline) = &config.kernel_cmdline {
        return Ok(Some(cmdline.clone()));
    }
    if verity_root_entries(&contents.fstab)?.is_empty() {
        return Ok(None);
    }
    if let Some(cmdline) = read_boot_cmdline(backend, partitions, scratch)? {
        return Ok(Some(cmdline));
    }
    Ok(contents.kernel_cmdline.clone())
}

/// An image attached and mounted under a chroot directory.
///
/// Field order is teardown order: mounts, then the chroot directory, then the
/// device.
pub struct ImageConnection {
    mounts: Option<ChrootMounts>,
    chroot_dir: PathBuf,
    device: Option<Box<dyn AttachedDevice>>,
    inspection: ImageInspection,
}

impl ImageConnection {
    pub fn chroot_dir(&self) -> &Path {
        &self.chroot_dir
    }

    pub fn inspection(&self) -> &ImageInspection {
        &self.inspection
    }

    pub fn device_path(&self) -> Option<&str> {
        self.device.as_ref().map(|device| device.device_path())
    }

    /// Unmount everything, remove the chroot directory and detach the device
    pub fn close(mut self) -> Result<()> {
        if let Some(mounts) = self.mounts.take() {
            mounts.detach()?;
        }
        fs::remove_dir(&self.chroot_dir).map_err(EngineError::io(&self.chroot_dir))?;
        if let Some(device) = self.device.take() {
            device.detach()?;
        }
        Ok(())
    }
}

impl Drop for ImageConnection {
    fn drop(&mut self) {
        // close() already took the mounts
        let Some(mounts) = self.mounts.take() else {
            return;
        };
        drop(mounts);

        if let Err(error) = fs::remove_dir(&self.chroot_dir) {
            tracing::warn!(dir = %self.chroot_dir.display(), "failed to remove chroot dir: {error}");
        }
    }
}

/// Attach `image`, discover its layout and mount it under a fresh chroot directory
pub fn connect_image<B: Backend + ?Sized>(
    backend: &B,
    image: &Path,
    config: &EngineConfig,
) -> Result<ImageConnection> {
    let device = backend.attach(image)?;
    let inspection = inspect_device(backend, device.device_path(), config)?;

    let chroot_dir = config.chroot_dir()?;
    let mounts = match ChrootMounts::attach(backend, &chroot_dir, &inspection.plan) {
        Ok(mounts) => mounts,
        Err(error) => {
            if let Err(cleanup) = fs::remove_dir(&chroot_dir) {
                tracing::warn!(dir = %chroot_dir.display(), "failed to remove chroot dir: {cleanup}");
            }
            return Err(error);
        }
    };

    Ok(ImageConnection {
        mounts: Some(mounts),
        chroot_dir,
        device: Some(device),
        inspection,
    })
}

/// Result of building a new image
#[derive(Debug, Clone, Serialize)]
pub struct CreatedImage {
    pub allocated: PartitionIdMap,
    pub table: PartitionTable,
    pub fstab: Vec<FstabEntry>,
    pub plan: Vec<MountSpec>,
    pub verity: Option<VerityDeviceMetadata>,
}

/// Partition, format and populate an empty block device from `layout`
pub fn create_on_device<B: Backend + ?Sized>(
    backend: &B,
    device: &str,
    layout: &DiskLayout,
    config: &EngineConfig,
) -> Result<CreatedImage> {
    let _span = tracing::info_span!("create", device).entered();

    let allocated = allocate_partitions(backend, device, layout)?;
    format_filesystems(backend, layout, &allocated)?;

    let table = read_partition_table(backend, device)?;
    {
        let scratch = config.scratch_dir("subvolumes-")?;
        create_subvolumes(backend, layout, &allocated, &table.partitions, scratch.path())?;
    }

    let fstab = synthesize_fstab(layout, &allocated, &table.partitions)?;
    let verity_partitions = layout
        .verity
        .as_ref()
        .map(|verity| layout_partitions(verity, &allocated, &table.partitions))
        .transpose()?;

    let plan = if fstab.iter().any(|entry| entry.target == "/") {
        let plan = build_mount_plan(
            &fstab,
            &table.partitions,
            verity_partitions.map(|(data, _)| data),
            PlanOptions {
                read_only: false,
                read_only_verity: false,
                include_default_mounts: false,
            },
        )?;
        write_fstab(backend, config, &plan, &fstab)?;
        plan
    } else {
        tracing::warn!("layout mounts nothing at /, skipping /etc/fstab");
        Vec::new()
    };

    let verity = match (&layout.verity, verity_partitions) {
        (Some(verity_config), Some((data, hash))) => {
            let root_hash = backend.format_verity(&data.device_path, &hash.device_path)?;
            let source = VeritySource::Layout {
                config: verity_config,
                allocated: &allocated,
                root_hash: &root_hash,
            };
            match discover_verity(&fstab, &table.partitions, source)? {
                Some(metadata) => Some(metadata),
                None => Some(metadata_from_layout(
                    verity_config,
                    &allocated,
                    &table.partitions,
                    &root_hash,
                    true,
                )?),
            }
        }
        _ => None,
    };

    tracing::info!(partitions = allocated.len(), mounts = plan.len(), "image created");
    Ok(CreatedImage {
        allocated,
        table,
        fstab,
        plan,
        verity,
    })
}

/// Mount the new image's plan and write its `/etc/fstab`
fn write_fstab<B: Backend + ?Sized>(
    backend: &B,
    config: &EngineConfig,
    plan: &[MountSpec],
    fstab: &[FstabEntry],
) -> Result<()> {
    let chroot_dir = config.chroot_dir()?;
    let result = (|| -> Result<()> {
        let mounts = ChrootMounts::attach(backend, &chroot_dir, plan)?;

        let etc = chroot_path(&chroot_dir, "/etc");
        fs::create_dir_all(&etc).map_err(EngineError::io(&etc))?;
        let path = etc.join("fstab");
        fs::write(&path, render_fstab(fstab)).map_err(EngineError::io(&path))?;
        tracing::info!(entries = fstab.len(), "wrote /etc/fstab");

        mounts.detach()
    })();

    match (result, fs::remove_dir(&chroot_dir)) {
        (Err(error), Err(cleanup)) => {
            tracing::warn!(dir = %chroot_dir.display(), "failed to remove chroot dir: {cleanup}");
            Err(error)
        }
        (Err(error), Ok(())) => Err(error),
        (Ok(()), removed) => removed.map_err(EngineError::io(&chroot_dir)),
    }
}

/// Attach `image`, build it from `layout` and detach again
pub fn create_image<B: Backend + ?Sized>(
    backend: &B,
    image: &Path,
    layout: &DiskLayout,
    config: &EngineConfig,
) -> Result<CreatedImage> {
    // fail on a bad layout before the image is even attached
    layout.validate()?;

    let device = backend.attach(image)?;
    let created = create_on_device(backend, device.device_path(), layout, config)?;
    device.detach()?;
    Ok(created)
}
