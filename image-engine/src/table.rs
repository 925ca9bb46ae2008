// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;

use serde::Serialize;

use image_types::{Partition, PartitionTableType};

use crate::backend::PartitionOps;
use crate::error::{EngineError, Result};

/// A probed partition table: on-disk layout plus filesystem signatures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionTable {
    pub device: String,
    pub table_type: PartitionTableType,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn find_by_device(&self, device_path: &str) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|partition| partition.device_path == device_path)
    }
}

/// Read and probe the partition table of an attached block device
pub fn read_partition_table<B: PartitionOps + ?Sized>(
    backend: &B,
    device: &str,
) -> Result<PartitionTable> {
    let _span = tracing::debug_span!("read_partition_table", device).entered();

    let raw = backend
        .read_table(device)
        .map_err(|error| EngineError::PartitionTableUnreadable {
            device: device.to_string(),
            reason: error.to_string(),
        })?;

    if raw.partitions.is_empty() {
        return Err(EngineError::PartitionTableEmpty {
            device: device.to_string(),
        });
    }

    let mut partitions = Vec::with_capacity(raw.partitions.len());
    for entry in raw.partitions {
        let probe = backend.probe(&entry.node)?;
        if probe.fs_type.is_empty() {
            tracing::debug!(partition = %entry.node, "no filesystem detected");
        }

        partitions.push(Partition {
            index: entry.number,
            device_path: entry.node,
            part_uuid: entry.part_uuid,
            type_guid: entry.type_id,
            part_label: entry.name,
            start_bytes: entry.start_bytes,
            size_bytes: entry.size_bytes,
            fs_type: probe.fs_type,
            fs_uuid: probe.uuid,
            fs_label: probe.label,
        });
    }

    let mut seen = HashSet::new();
    if let Some(duplicate) = partitions.iter().find(|partition| !seen.insert(partition.index)) {
        return Err(EngineError::PartitionTableUnreadable {
            device: device.to_string(),
            reason: format!("partition number {} appears twice", duplicate.index),
        });
    }

    tracing::debug!(count = partitions.len(), "read partition table");
    Ok(PartitionTable {
        device: device.to_string(),
        table_type: raw.table_type,
        partitions,
    })
}

/// Read the partitions of `device`, dropping the table metadata
pub fn read_partitions<B: PartitionOps + ?Sized>(backend: &B, device: &str) -> Result<Vec<Partition>> {
    Ok(read_partition_table(backend, device)?.partitions)
}
