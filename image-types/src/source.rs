// SPDX-License-Identifier: GPL-3.0-only

//! Typed fstab `source` identifiers
//!
//! Parsing is kept apart from resolution: [`ExtendedSourceSpec::parse`] never looks at
//! a partition table, and whether a device path names the verity root is a separate
//! question answered by [`ExtendedSourceSpec::is_verity_root`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::partition::Partition;

/// Directory holding device-mapper nodes
pub const DEVICE_MAPPER_PATH: &str = "/dev/mapper";

pub const VERITY_ROOT_DEVICE_NAME: &str = "root";
pub const VERITY_USR_DEVICE_NAME: &str = "usr";

/// Reserved device path of the verity-protected root filesystem
pub const VERITY_ROOT_DEVICE_PATH: &str = "/dev/mapper/root";

pub fn verity_device_path(name: &str) -> String {
    format!("{DEVICE_MAPPER_PATH}/{name}")
}

/// The identifier named by an fstab `source` field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum ExtendedSourceSpec {
    Uuid(String),
    PartUuid(String),
    PartLabel(String),
    Label(String),
    DevicePath(String),
}

impl ExtendedSourceSpec {
    pub fn parse(source: &str) -> Result<Self> {
        if let Some(value) = source.strip_prefix("UUID=") {
            return Ok(Self::Uuid(value.to_string()));
        }
        if let Some(value) = source.strip_prefix("PARTUUID=") {
            return Ok(Self::PartUuid(value.to_string()));
        }
        if let Some(value) = source.strip_prefix("PARTLABEL=") {
            return Ok(Self::PartLabel(value.to_string()));
        }
        if let Some(value) = source.strip_prefix("LABEL=") {
            return Ok(Self::Label(value.to_string()));
        }
        if source.starts_with("/dev/") {
            return Ok(Self::DevicePath(source.to_string()));
        }

        Err(TypesError::UnsupportedSourceFormat {
            value: source.to_string(),
        })
    }

    /// Name of the identifier kind, as used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Uuid(_) => "UUID",
            Self::PartUuid(_) => "PARTUUID",
            Self::PartLabel(_) => "PARTLABEL",
            Self::Label(_) => "LABEL",
            Self::DevicePath(_) => "device",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Uuid(value)
            | Self::PartUuid(value)
            | Self::PartLabel(value)
            | Self::Label(value)
            | Self::DevicePath(value) => value,
        }
    }

    pub fn is_verity_root(&self) -> bool {
        matches!(self, Self::DevicePath(path) if path == VERITY_ROOT_DEVICE_PATH)
    }

    /// Whether `partition`'s probed metadata carries this identifier.
    ///
    /// Device paths never match a physical partition.
    pub fn matches(&self, partition: &Partition) -> bool {
        match self {
            Self::Uuid(value) => !value.is_empty() && partition.fs_uuid == *value,
            Self::PartUuid(value) => {
                !value.is_empty() && partition.part_uuid.eq_ignore_ascii_case(value)
            }
            Self::PartLabel(value) => !value.is_empty() && partition.part_label == *value,
            Self::Label(value) => !value.is_empty() && partition.fs_label == *value,
            Self::DevicePath(_) => false,
        }
    }
}

impl FromStr for ExtendedSourceSpec {
    type Err = TypesError;

    fn from_str(source: &str) -> Result<Self> {
        Self::parse(source)
    }
}

impl fmt::Display for ExtendedSourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DevicePath(path) => write!(f, "{path}"),
            other => write!(f, "{}={}", other.kind(), other.value()),
        }
    }
}

/// How a partition is referenced from fstab, kernel args, or boot configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountIdType {
    Uuid,
    PartUuid,
    PartLabel,
    /// No explicit choice; partitions are referenced by PARTUUID and the
    /// verity root by its fixed device-mapper path.
    #[default]
    Default,
}

impl MountIdType {
    /// Format the identifier of `partition` as an fstab/systemd source string
    pub fn format_source(self, partition: &Partition) -> String {
        match self {
            Self::Uuid => format!("UUID={}", partition.fs_uuid),
            Self::PartLabel => format!("PARTLABEL={}", partition.part_label),
            Self::PartUuid | Self::Default => format!("PARTUUID={}", partition.part_uuid),
        }
    }
}

/// Map the root filesystem's source identifier to how the bootloader references it
pub fn root_mount_id_type(root: &ExtendedSourceSpec) -> Result<MountIdType> {
    match root {
        ExtendedSourceSpec::Uuid(_) => Ok(MountIdType::Uuid),
        ExtendedSourceSpec::PartUuid(_) => Ok(MountIdType::PartUuid),
        ExtendedSourceSpec::PartLabel(_) => Ok(MountIdType::PartLabel),
        ExtendedSourceSpec::DevicePath(_) if root.is_verity_root() => Ok(MountIdType::Default),
        ExtendedSourceSpec::Label(_) | ExtendedSourceSpec::DevicePath(_) => Err(
            TypesError::UnsupportedRootMountIdentifier(root.to_string()),
        ),
    }
}
