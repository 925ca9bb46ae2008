// SPDX-License-Identifier: GPL-3.0-only

//! Partition table reading and writing through `sfdisk`

use serde::Deserialize;

use image_types::{PARTITION_ALIGNMENT_BYTES, PartitionTableType, partition_number};

use crate::cmd::{require_tool, run, run_capture, run_with_stdin};
use crate::error::{Result, SysError};

const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    label: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    start: u64,
    size: u64,
    #[serde(rename = "type")]
    type_id: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Partition table as stored on disk, before filesystem probing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPartitionTable {
    pub device: String,
    pub table_type: PartitionTableType,
    pub sector_size: u64,
    pub partitions: Vec<RawPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPartition {
    /// Partition number, starting at 1
    pub number: u32,
    pub node: String,
    pub start_bytes: u64,
    pub size_bytes: u64,
    pub type_id: String,
    pub part_uuid: String,
    pub name: String,
}

/// Read the partition table of `device` with `sfdisk --dump --json`
pub fn read_partition_table(device: &str) -> Result<RawPartitionTable> {
    let output = run_capture("sfdisk", &["--dump", "--json", device])?;
    parse_sfdisk_dump(device, &output)
}

pub fn parse_sfdisk_dump(device: &str, json: &str) -> Result<RawPartitionTable> {
    let dump: SfdiskDump = serde_json::from_str(json).map_err(|error| SysError::Parse {
        what: "sfdisk".to_string(),
        reason: error.to_string(),
    })?;
    let table = dump.partitiontable;

    let table_type = PartitionTableType::parse(&table.label).ok_or_else(|| SysError::Parse {
        what: "sfdisk".to_string(),
        reason: format!("unsupported partition table label '{}'", table.label),
    })?;
    let sector_size = table.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE);

    let mut partitions = Vec::with_capacity(table.partitions.len());
    for (position, entry) in table.partitions.into_iter().enumerate() {
        let number = partition_number(device, &entry.node).unwrap_or(position as u32 + 1);

        let part_uuid = match (table_type, entry.uuid) {
            (_, Some(uuid)) => uuid.to_ascii_lowercase(),
            // dos tables derive PARTUUID from the disk identifier
            (PartitionTableType::Dos, None) => table
                .id
                .as_deref()
                .map(|id| format!("{}-{:02x}", id.trim_start_matches("0x"), number))
                .unwrap_or_default(),
            (PartitionTableType::Gpt, None) => String::new(),
        };

        partitions.push(RawPartition {
            number,
            node: entry.node,
            start_bytes: entry.start * sector_size,
            size_bytes: entry.size * sector_size,
            type_id: entry.type_id.to_ascii_lowercase(),
            part_uuid,
            name: entry.name.unwrap_or_default(),
        });
    }

    Ok(RawPartitionTable {
        device: device.to_string(),
        table_type,
        sector_size,
        partitions,
    })
}

/// One partition to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub start_bytes: u64,
    /// `None` takes the remaining space
    pub size_bytes: Option<u64>,
    pub type_id: String,
    pub part_uuid: Option<String>,
    pub name: Option<String>,
}

/// Escape a partition name for an sfdisk script
pub fn escape_name(name: &str) -> String {
    name.replace('\\', "\\x5c").replace('"', "\\x22")
}

fn mib(bytes: u64) -> u64 {
    bytes / PARTITION_ALIGNMENT_BYTES
}

/// Build an sfdisk script creating `partitions` in order.
///
/// Offsets are written in MiB so the script does not depend on the sector size.
pub fn build_script(table_type: PartitionTableType, partitions: &[PartitionRequest]) -> String {
    let mut script = format!("label: {}\n", table_type.as_sfdisk_str());

    for partition in partitions {
        let mut fields = vec![format!("start={}MiB", mib(partition.start_bytes))];
        if let Some(size) = partition.size_bytes {
            fields.push(format!("size={}MiB", mib(size)));
        }
        fields.push(format!("type={}", partition.type_id));

        if table_type == PartitionTableType::Gpt {
            if let Some(uuid) = &partition.part_uuid {
                fields.push(format!("uuid={uuid}"));
            }
            if let Some(name) = &partition.name {
                fields.push(format!("name=\"{}\"", escape_name(name)));
            }
        }

        script.push_str(&fields.join(", "));
        script.push('\n');
    }

    script
}

/// Write a fresh partition table to `device` and have the kernel re-read it
pub fn write_partition_table(device: &str, script: &str) -> Result<()> {
    tracing::info!(device, "writing partition table");
    run_with_stdin("sfdisk", &["--wipe", "always", device], script)?;
    refresh_partitions(device)
}

/// Ask the kernel to re-read the partition table and wait for udev
pub fn refresh_partitions(device: &str) -> Result<()> {
    let outcome = run("partprobe", &[device])?;
    if !outcome.success() {
        return Err(SysError::CommandFailed {
            command: outcome.command,
            stderr: outcome.stderr,
        });
    }

    if require_tool("udevadm").is_ok() {
        let settle = run("udevadm", &["settle"])?;
        if !settle.success() {
            tracing::warn!(stderr = %settle.stderr, "udevadm settle failed");
        }
    }

    Ok(())
}
