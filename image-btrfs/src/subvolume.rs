// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use btrfsutil::subvolume::Subvolume;
use image_sys::run_capture;
use image_types::{strip_fs_tree_prefix, validate_subvolume_path};

use crate::error::{BtrfsError, Result};

/// Manager for BTRFS subvolume operations on a mounted top-level filesystem
pub struct SubvolumeManager {
    mount_point: PathBuf,
}

impl SubvolumeManager {
    /// Create a new SubvolumeManager for the given mount point
    pub fn new<P: Into<PathBuf>>(mount_point: P) -> Result<Self> {
        let mount_point = mount_point.into();

        // Verify the path is a BTRFS filesystem
        match Subvolume::try_from(mount_point.as_path()) {
            Ok(_) => Ok(Self { mount_point }),
            Err(e) => Err(BtrfsError::NotMounted(format!(
                "{}: {}",
                mount_point.display(),
                e
            ))),
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Paths of every subvolume, relative to the top level
    pub fn list_paths(&self) -> Result<Vec<String>> {
        // btrfsutil's iterator fails with "Could not statfs" under pkexec; the CLI does not
        let mount_point = self.mount_point.to_string_lossy();
        let output = run_capture("btrfs", &["subvolume", "list", "-a", &mount_point])?;

        let paths = parse_subvolume_list(&output)?;
        tracing::debug!(
            mount_point = %self.mount_point.display(),
            count = paths.len(),
            "listed subvolumes"
        );
        Ok(paths)
    }

    /// Create a subvolume at `path` below the top level.
    ///
    /// Intermediate directories that are not themselves subvolumes are created
    /// as plain directories.
    pub fn create(&self, path: &str) -> Result<()> {
        validate_subvolume_path(path).map_err(|e| BtrfsError::InvalidPath(e.to_string()))?;

        let subvol_path = self.mount_point.join(path);
        if let Some(parent) = subvol_path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|error| BtrfsError::Io {
                path: parent.to_path_buf(),
                error,
            })?;
        }

        Subvolume::create(subvol_path.as_path(), None).map_err(|e| BtrfsError::CreateFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(path, mount_point = %self.mount_point.display(), "created subvolume");
        Ok(())
    }
}

/// Parse `btrfs subvolume list` output into bare relative paths.
///
/// Every non-blank line must carry a ` path <value>` suffix; the `<FS_TREE>/`
/// prefix printed with `-a` is removed.
pub fn parse_subvolume_list(output: &str) -> Result<Vec<String>> {
    let mut paths = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let path = line
            .split_once(" path ")
            .map(|(_, path)| path.trim())
            .filter(|path| !path.is_empty())
            .ok_or_else(|| BtrfsError::SubvolumeListParseError {
                line: line.to_string(),
            })?;

        paths.push(strip_fs_tree_prefix(path).to_string());
    }

    Ok(paths)
}
