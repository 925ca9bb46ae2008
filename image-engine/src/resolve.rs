// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use image_types::{ExtendedSourceSpec, FstabEntry, MountIdType, Partition};

use crate::error::{EngineError, Result};

/// Why a source identifier did not name exactly one partition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    #[error("partition not found")]
    NotFound,

    #[error("too many matches ({0} partitions)")]
    TooManyMatches(usize),

    #[error("device paths other than the verity root are not supported")]
    UnsupportedDevicePath,

    #[error("verity root used but no verity metadata was discovered")]
    NoVerityRoot,
}

/// Find the single partition whose probed metadata carries `spec`.
///
/// Device paths never name a physical partition; the verity root is handled
/// by [`resolve_source`].
pub fn find_partition<'a>(
    spec: &ExtendedSourceSpec,
    partitions: &'a [Partition],
) -> std::result::Result<&'a Partition, ResolveFailure> {
    if matches!(spec, ExtendedSourceSpec::DevicePath(_)) {
        return Err(ResolveFailure::UnsupportedDevicePath);
    }

    let mut matched = partitions.iter().filter(|partition| spec.matches(partition));
    let first = matched.next().ok_or(ResolveFailure::NotFound)?;

    let extra = matched.count();
    if extra > 0 {
        return Err(ResolveFailure::TooManyMatches(extra + 1));
    }

    Ok(first)
}

/// Resolve a mount source, mapping the verity root onto its data partition
pub fn resolve_source<'a>(
    spec: &ExtendedSourceSpec,
    partitions: &'a [Partition],
    verity_data: Option<&'a Partition>,
) -> std::result::Result<&'a Partition, ResolveFailure> {
    if spec.is_verity_root() {
        return verity_data.ok_or(ResolveFailure::NoVerityRoot);
    }
    find_partition(spec, partitions)
}

/// How boot configuration should reference the root filesystem of `entries`
pub fn root_mount_id_type(entries: &[FstabEntry]) -> Result<MountIdType> {
    let mut roots = entries.iter().filter(|entry| entry.target == "/");
    let root = roots.next().ok_or(EngineError::RootMountMissing)?;
    if roots.next().is_some() {
        return Err(EngineError::DuplicateMountTarget {
            target: "/".to_string(),
        });
    }

    let spec = ExtendedSourceSpec::parse(&root.source)?;
    Ok(image_types::root_mount_id_type(&spec)?)
}
