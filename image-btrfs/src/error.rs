// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for BTRFS operations
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("Filesystem not mounted: {0}")]
    NotMounted(String),

    #[error("Unexpected subvolume list output: {line:?}")]
    SubvolumeListParseError { line: String },

    #[error("Failed to create subvolume '{path}': {reason}")]
    CreateFailed { path: String, reason: String },

    #[error("Invalid subvolume path: {0}")]
    InvalidPath(String),

    #[error("Failed to prepare {path:?}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error(transparent)]
    Command(#[from] image_sys::SysError),
}

/// Result type alias for BTRFS operations
pub type Result<T> = std::result::Result<T, BtrfsError>;
