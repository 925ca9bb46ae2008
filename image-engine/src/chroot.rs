// SPDX-License-Identifier: GPL-3.0-only

use std::fs;
use std::path::{Path, PathBuf};

use image_sys::MountRequest;
use image_types::MountSpec;

use crate::backend::{FilesystemOps, MountHandle};
use crate::error::{EngineError, Result};

/// Mounts of a plan executed under a chroot directory.
///
/// Mounts are released in reverse order, either by [`ChrootMounts::detach`] or
/// on drop; a failed attach unwinds whatever it had already mounted.
pub struct ChrootMounts {
    root: PathBuf,
    handles: Vec<Box<dyn MountHandle>>,
}

impl std::fmt::Debug for ChrootMounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChrootMounts")
            .field("root", &self.root)
            .field(
                "mounted",
                &self.handles.iter().map(|handle| handle.target()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Location of a plan target inside `root`
pub fn chroot_path(root: &Path, target: &str) -> PathBuf {
    root.join(target.trim_start_matches('/'))
}

impl ChrootMounts {
    /// Mount every entry of `plan` under `root`, in order
    pub fn attach<B: FilesystemOps + ?Sized>(
        backend: &B,
        root: &Path,
        plan: &[MountSpec],
    ) -> Result<Self> {
        let _span = tracing::info_span!("chroot_attach", root = %root.display()).entered();

        let mut mounts = Self {
            root: root.to_path_buf(),
            handles: Vec::with_capacity(plan.len()),
        };

        for spec in plan {
            let target = chroot_path(root, &spec.target);
            if !target.exists() {
                fs::create_dir_all(&target).map_err(EngineError::io(&target))?;
            }

            let data = spec.effective_data();
            let handle = backend.mount(&MountRequest {
                device: &spec.source_device,
                target: &target,
                fs_type: &spec.fs_type,
                flags: spec.effective_flags(),
                data: &data,
            })?;
            mounts.handles.push(handle);
        }

        tracing::info!(count = mounts.handles.len(), "chroot attached");
        Ok(mounts)
    }

    /// Unmount everything in reverse order, reporting the first failure
    pub fn detach(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(handle) = self.handles.pop() {
            let target = handle.target().to_path_buf();
            if let Err(error) = handle.unmount() {
                tracing::warn!(target = %target.display(), "unmount failed: {error}");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl Drop for ChrootMounts {
    fn drop(&mut self) {
        while let Some(handle) = self.handles.pop() {
            if let Err(error) = handle.unmount() {
                tracing::warn!("{error}");
            }
        }
    }
}
