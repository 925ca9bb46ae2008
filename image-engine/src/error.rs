// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for the partition and mount resolution engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Types(#[from] image_types::TypesError),

    #[error(transparent)]
    Sys(#[from] image_sys::SysError),

    #[error(transparent)]
    Btrfs(#[from] image_btrfs::BtrfsError),

    #[error("no readable partition table on {device}: {reason}")]
    PartitionTableUnreadable { device: String, reason: String },

    #[error("partition table on {device} has no partitions")]
    PartitionTableEmpty { device: String },

    #[error("no partition contains /etc/fstab (scanned: {scanned})")]
    RootfsNotFound { scanned: String },

    #[error("cannot resolve mount source '{spec}' for {target}: {reason}")]
    MountSourceUnresolved {
        spec: String,
        target: String,
        reason: String,
    },

    #[error("fstab has no entry for /")]
    RootMountMissing,

    #[error("more than one fstab entry mounts {target}")]
    DuplicateMountTarget { target: String },

    #[error("found {count} verity root entries; only one is supported")]
    MultipleVerityRootsUnsupported { count: usize },

    #[error("verity {role} partition not found: {reason}")]
    VerityPartitionNotFound { role: &'static str, reason: String },

    #[error("verity data and hash partitions are both {device}")]
    VerityPartitionsOverlap { device: String },

    #[error("verity hash device {device} does not match its data device: {reason}")]
    VerityHashTreeMismatch { device: String, reason: String },

    #[error("grub.cfg names boot partition {uuid}, which is not on the disk")]
    BootPartitionNotFound { uuid: String },

    #[error("kernel command line has no verity root hash")]
    VerityRootHashMissing,

    #[error("filesystem '{device_id}' has no allocated device")]
    DevicePathNotFound { device_id: String },

    #[error("no filesystem type detected on {device}")]
    FsTypeNotFound { device: String },

    #[error("{device} holds {fs_type}, not btrfs")]
    NotBtrfsFilesystem { device: String, fs_type: String },

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("I/O error on {path:?}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |error| Self::Io { path, error }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
