// SPDX-License-Identifier: GPL-3.0-only

//! dm-verity root discovery
//!
//! An image has a verity root when its fstab mounts the reserved
//! `/dev/mapper/root` device. Existing images name the backing partitions on
//! the kernel command line; new images declare them in their layout.

use image_types::{
    ExtendedSourceSpec, FstabEntry, MountIdType, Partition, VERITY_ROOT_DEVICE_NAME,
    VERITY_USR_DEVICE_NAME, VerityConfig, VerityDeviceMetadata, VerityOptions, VeritySuperblock,
};

use crate::allocator::PartitionIdMap;
use crate::backend::FilesystemOps;
use crate::error::{EngineError, Result};
use crate::resolve::find_partition;

const VERITY_ROOT_DATA_ARG: &str = "systemd.verity_root_data";
const VERITY_ROOT_HASH_ARG: &str = "systemd.verity_root_hash";
const VERITY_ROOT_OPTIONS_ARG: &str = "systemd.verity_root_options";
const ROOT_HASH_ARG: &str = "roothash";

/// Where the verity partition pairing comes from
#[derive(Debug, Clone, Copy)]
pub enum VeritySource<'a> {
    /// An existing image's kernel command line
    KernelCmdline(&'a str),
    /// A new image's declared layout and its freshly computed root hash
    Layout {
        config: &'a VerityConfig,
        allocated: &'a PartitionIdMap,
        root_hash: &'a str,
    },
}

/// One `name[=value]` kernel argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
    pub name: String,
    pub value: Option<String>,
}

/// Split a kernel command line into arguments, honouring double quotes
pub fn parse_kernel_cmdline(cmdline: &str) -> Vec<KernelArg> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for character in cmdline.chars() {
        match character {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((name, value)) => KernelArg {
                name: name.to_string(),
                value: Some(value.to_string()),
            },
            None => KernelArg {
                name: word,
                value: None,
            },
        })
        .collect()
}

/// Value of the last occurrence of `name`, as the kernel would see it
pub fn find_kernel_arg<'a>(args: &'a [KernelArg], name: &str) -> Option<&'a str> {
    args.iter()
        .rev()
        .find(|arg| arg.name == name)
        .and_then(|arg| arg.value.as_deref())
}

/// Fstab entries that mount the verity root
pub fn verity_root_entries(entries: &[FstabEntry]) -> Result<Vec<&FstabEntry>> {
    let mut found = Vec::new();
    for entry in entries.iter().filter(|entry| !entry.is_pseudo_filesystem()) {
        if entry.fs_type != "swap" && ExtendedSourceSpec::parse(&entry.source)?.is_verity_root() {
            found.push(entry);
        }
    }
    Ok(found)
}

/// Discover the verity root of an image, if its fstab uses one
pub fn discover_verity(
    entries: &[FstabEntry],
    partitions: &[Partition],
    source: VeritySource<'_>,
) -> Result<Option<VerityDeviceMetadata>> {
    let verity_entries = verity_root_entries(entries)?;
    let entry = match verity_entries.as_slice() {
        [] => return Ok(None),
        [entry] => *entry,
        many => {
            return Err(EngineError::MultipleVerityRootsUnsupported { count: many.len() });
        }
    };

    let metadata = match source {
        VeritySource::KernelCmdline(cmdline) => from_kernel_cmdline(cmdline, partitions, entry)?,
        VeritySource::Layout {
            config,
            allocated,
            root_hash,
        } => metadata_from_layout(config, allocated, partitions, root_hash, entry.has_option("ro"))?,
    };

    if metadata.data_partition.device_path == metadata.hash_partition.device_path {
        return Err(EngineError::VerityPartitionsOverlap {
            device: metadata.data_partition.device_path,
        });
    }

    tracing::info!(
        data = %metadata.data_partition.device_path,
        hash = %metadata.hash_partition.device_path,
        "discovered verity root"
    );
    Ok(Some(metadata))
}

fn from_kernel_cmdline(
    cmdline: &str,
    partitions: &[Partition],
    entry: &FstabEntry,
) -> Result<VerityDeviceMetadata> {
    let args = parse_kernel_cmdline(cmdline);

    let (data_partition, data_id_type) = cmdline_partition(&args, VERITY_ROOT_DATA_ARG, "data", partitions)?;
    let (hash_partition, hash_id_type) = cmdline_partition(&args, VERITY_ROOT_HASH_ARG, "hash", partitions)?;

    let root_hash = find_kernel_arg(&args, ROOT_HASH_ARG)
        .filter(|hash| !hash.is_empty())
        .ok_or(EngineError::VerityRootHashMissing)?;
    let options = match find_kernel_arg(&args, VERITY_ROOT_OPTIONS_ARG) {
        Some(text) => VerityOptions::parse(text)?,
        None => VerityOptions::default(),
    };

    Ok(VerityDeviceMetadata {
        name: VERITY_ROOT_DEVICE_NAME.to_string(),
        data_partition: data_partition.clone(),
        hash_partition: hash_partition.clone(),
        root_hash: root_hash.to_string(),
        read_only: entry.has_option("ro"),
        data_id_type,
        hash_id_type,
        options,
    })
}

fn cmdline_partition<'a>(
    args: &[KernelArg],
    arg_name: &str,
    role: &'static str,
    partitions: &'a [Partition],
) -> Result<(&'a Partition, MountIdType)> {
    let not_found = |reason: String| EngineError::VerityPartitionNotFound { role, reason };

    let identifier = find_kernel_arg(args, arg_name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| not_found(format!("{arg_name}= is not on the kernel command line")))?;

    let spec = ExtendedSourceSpec::parse(identifier)?;
    let id_type = match spec {
        ExtendedSourceSpec::Uuid(_) => MountIdType::Uuid,
        ExtendedSourceSpec::PartUuid(_) => MountIdType::PartUuid,
        ExtendedSourceSpec::PartLabel(_) => MountIdType::PartLabel,
        ExtendedSourceSpec::Label(_) | ExtendedSourceSpec::DevicePath(_) => {
            return Err(not_found(format!("unsupported identifier '{identifier}'")));
        }
    };

    let partition = find_partition(&spec, partitions)
        .map_err(|failure| not_found(format!("{identifier}: {failure}")))?;
    Ok((partition, id_type))
}

/// Verity metadata of a new image, straight from its layout
pub fn metadata_from_layout(
    config: &VerityConfig,
    allocated: &PartitionIdMap,
    partitions: &[Partition],
    root_hash: &str,
    read_only: bool,
) -> Result<VerityDeviceMetadata> {
    let (data, hash) = layout_partitions(config, allocated, partitions)?;
    Ok(VerityDeviceMetadata {
        name: config.name.clone(),
        data_partition: data.clone(),
        hash_partition: hash.clone(),
        root_hash: root_hash.to_string(),
        read_only,
        data_id_type: config.data_id_type,
        hash_id_type: config.hash_id_type,
        options: VerityOptions {
            corruption: config.corruption_option,
            hash_signature_path: config.hash_signature_path.clone(),
        },
    })
}

/// Data and hash partitions named by a layout's verity table
pub fn layout_partitions<'a>(
    config: &VerityConfig,
    allocated: &PartitionIdMap,
    partitions: &'a [Partition],
) -> Result<(&'a Partition, &'a Partition)> {
    let data = layout_partition(
        "data",
        config.data_device_id.as_deref(),
        config.data_part_label.as_deref(),
        allocated,
        partitions,
    )?;
    let hash = layout_partition(
        "hash",
        config.hash_device_id.as_deref(),
        config.hash_part_label.as_deref(),
        allocated,
        partitions,
    )?;
    Ok((data, hash))
}

fn layout_partition<'a>(
    role: &'static str,
    device_id: Option<&str>,
    part_label: Option<&str>,
    allocated: &PartitionIdMap,
    partitions: &'a [Partition],
) -> Result<&'a Partition> {
    let not_found = |reason: String| EngineError::VerityPartitionNotFound { role, reason };

    match (device_id, part_label) {
        (Some(id), _) => {
            let device_path = &allocated
                .get(id)
                .ok_or_else(|| not_found(format!("partition id '{id}' was not allocated")))?
                .device_path;
            partitions
                .iter()
                .find(|partition| partition.device_path == *device_path)
                .ok_or_else(|| not_found(format!("{device_path} is not in the partition table")))
        }
        (None, Some(label)) => {
            let spec = ExtendedSourceSpec::PartLabel(label.to_string());
            find_partition(&spec, partitions)
                .map_err(|failure| not_found(format!("PARTLABEL={label}: {failure}")))
        }
        (None, None) => Err(not_found("no partition id or label declared".to_string())),
    }
}

/// Kernel arguments that make systemd open the verity device at boot
pub fn kernel_cmdline_args(metadata: &VerityDeviceMetadata) -> Vec<String> {
    let (prefix, hash_arg) = if metadata.name == VERITY_USR_DEVICE_NAME {
        ("usr", "usrhash")
    } else {
        ("root", ROOT_HASH_ARG)
    };

    let mut args = vec![
        "rd.systemd.verity=1".to_string(),
        format!("{hash_arg}={}", metadata.root_hash),
        format!(
            "systemd.verity_{prefix}_data={}",
            metadata.data_id_type.format_source(&metadata.data_partition)
        ),
        format!(
            "systemd.verity_{prefix}_hash={}",
            metadata.hash_id_type.format_source(&metadata.hash_partition)
        ),
    ];

    let options = metadata.options.to_systemd_string();
    if !options.is_empty() {
        args.push(format!("systemd.verity_{prefix}_options={options}"));
    }
    args
}

/// Check that the hash partition's superblock fits the data partition it protects
pub fn verify_hash_partition<B: FilesystemOps + ?Sized>(
    backend: &B,
    metadata: &VerityDeviceMetadata,
) -> Result<VeritySuperblock> {
    let hash_device = &metadata.hash_partition.device_path;
    let superblock = backend.read_verity_superblock(hash_device)?;

    let mismatch = |reason: String| EngineError::VerityHashTreeMismatch {
        device: hash_device.clone(),
        reason,
    };

    let data_bytes = superblock.data_blocks * u64::from(superblock.data_block_size);
    if data_bytes > metadata.data_partition.size_bytes {
        return Err(mismatch(format!(
            "covers {data_bytes} bytes but {} holds {}",
            metadata.data_partition.device_path, metadata.data_partition.size_bytes
        )));
    }

    let tree_bytes = superblock.hash_tree_size_bytes()?;
    if tree_bytes > metadata.hash_partition.size_bytes {
        return Err(mismatch(format!(
            "hash tree needs {tree_bytes} bytes, partition holds {}",
            metadata.hash_partition.size_bytes
        )));
    }

    Ok(superblock)
}
