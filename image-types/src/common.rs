//! Sizes and extents of partitions on an image

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

const MIB: u64 = 1024 * 1024;

/// Boundary every partition start, end and disk size must sit on
pub const PARTITION_ALIGNMENT_BYTES: u64 = MIB;

pub fn is_aligned(value: u64) -> bool {
    value % PARTITION_ALIGNMENT_BYTES == 0
}

/// Fail with `AlignmentInvalid` unless `value` is on a MiB boundary
pub fn require_aligned(what: &str, value: u64) -> Result<()> {
    if is_aligned(value) {
        Ok(())
    } else {
        Err(TypesError::AlignmentInvalid {
            what: what.to_string(),
            value,
        })
    }
}

/// Bytes `[start, end)` a declared partition occupies on the image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionExtent {
    pub start: u64,
    pub end: u64,
}

impl PartitionExtent {
    /// Non-empty and within an image of `image_size` bytes
    pub fn fits_within(&self, image_size: u64) -> bool {
        self.start < self.end && self.end <= image_size
    }

    /// Starts at or after the end of `previous`; layouts list partitions in disk order
    pub fn follows(&self, previous: &PartitionExtent) -> bool {
        self.start >= previous.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A size in bytes, written in config files either as a plain integer or
/// as a string with a binary unit suffix (`K`, `M`, `G`, `T`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "SizeRepr", into = "u64")]
pub struct DiskSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<SizeRepr> for DiskSize {
    type Error = TypesError;

    fn try_from(value: SizeRepr) -> Result<Self> {
        match value {
            SizeRepr::Bytes(bytes) => Ok(DiskSize(bytes)),
            SizeRepr::Text(text) => DiskSize::parse(&text),
        }
    }
}

impl From<DiskSize> for u64 {
    fn from(value: DiskSize) -> Self {
        value.0
    }
}

impl DiskSize {
    pub const fn mib(count: u64) -> Self {
        DiskSize(count * MIB)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let invalid = || TypesError::InvalidSize(text.to_string());

        let split_at = trimmed
            .find(|character: char| !character.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split_at);
        if digits.is_empty() {
            return Err(invalid());
        }

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        let multiplier: u64 = match suffix {
            "" => 1,
            "K" | "KiB" => 1 << 10,
            "M" | "MiB" => 1 << 20,
            "G" | "GiB" => 1 << 30,
            "T" | "TiB" => 1 << 40,
            _ => return Err(invalid()),
        };

        value.checked_mul(multiplier).map(DiskSize).ok_or_else(invalid)
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 != 0 && is_aligned(self.0) {
            write!(f, "{}M", self.0 / MIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}
