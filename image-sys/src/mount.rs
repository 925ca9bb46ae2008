// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};

use image_types::MountFlags;

use crate::error::{Result, SysError};

/// Arguments of one `mount(2)` call
#[derive(Debug, Clone, Copy)]
pub struct MountRequest<'a> {
    pub device: &'a str,
    pub target: &'a Path,
    pub fs_type: &'a str,
    pub flags: MountFlags,
    pub data: &'a str,
}

/// A mounted filesystem; unmounted when dropped
#[derive(Debug)]
pub struct MountGuard {
    target: PathBuf,
    mounted: bool,
}

pub fn to_ms_flags(flags: MountFlags) -> MsFlags {
    MsFlags::from_bits_truncate(flags.bits() as libc::c_ulong)
}

pub fn mount(request: &MountRequest<'_>) -> Result<MountGuard> {
    let data = (!request.data.is_empty()).then_some(request.data);

    nix::mount::mount(
        Some(request.device),
        request.target,
        Some(request.fs_type),
        to_ms_flags(request.flags),
        data,
    )
    .map_err(|errno| SysError::Mount {
        device: request.device.to_string(),
        target: request.target.to_path_buf(),
        fs_type: request.fs_type.to_string(),
        errno,
    })?;

    tracing::debug!(
        device = request.device,
        target = %request.target.display(),
        fs_type = request.fs_type,
        data = request.data,
        "mounted"
    );

    Ok(MountGuard {
        target: request.target.to_path_buf(),
        mounted: true,
    })
}

impl MountGuard {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Unmount, falling back to a lazy detach if the filesystem is busy
    pub fn unmount(mut self) -> Result<()> {
        self.mounted = false;
        unmount_path(&self.target)
    }
}

pub fn unmount_path(target: &Path) -> Result<()> {
    match nix::mount::umount2(target, MntFlags::empty()) {
        Ok(()) => {
            tracing::debug!(target = %target.display(), "unmounted");
            Ok(())
        }
        Err(errno) => {
            tracing::warn!(
                target = %target.display(),
                "unmount failed ({errno}), detaching lazily"
            );
            nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(|errno| SysError::Unmount {
                target: target.to_path_buf(),
                errno,
            })
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.mounted
            && let Err(error) = unmount_path(&self.target)
        {
            tracing::warn!("{error}");
        }
    }
}
