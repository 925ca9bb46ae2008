// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Parse and validation errors for the shared models
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypesError {
    #[error("unsupported fstab source format: '{value}'")]
    UnsupportedSourceFormat { value: String },

    #[error("malformed fstab line {line}: '{content}'")]
    FstabLineMalformed { line: usize, content: String },

    #[error("invalid size '{0}'")]
    InvalidSize(String),

    #[error("{what} ({value} bytes) is not a multiple of 1 MiB")]
    AlignmentInvalid { what: String, value: u64 },

    #[error("invalid subvolume path '{path}': {reason}")]
    InvalidSubvolumePath { path: String, reason: String },

    #[error("invalid disk layout: {0}")]
    LayoutInvalid(String),

    #[error("failed to parse disk layout: {0}")]
    LayoutParse(String),

    #[error("unsupported root mount identifier '{0}'")]
    UnsupportedRootMountIdentifier(String),

    #[error("unknown verity option '{0}'")]
    InvalidVerityOption(String),

    #[error("invalid verity superblock: {0}")]
    VeritySuperblockInvalid(String),

    #[error("system boot partition: {0}")]
    SystemBootPartition(String),
}

/// Result type alias for model parsing and validation
pub type Result<T> = std::result::Result<T, TypesError>;
