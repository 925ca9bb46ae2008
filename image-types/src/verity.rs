// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::partition::Partition;
use crate::source::MountIdType;

/// How the kernel reacts to a verity hash mismatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptionOption {
    #[default]
    IoError,
    Ignore,
    Panic,
    Restart,
}

impl CorruptionOption {
    /// The systemd-veritysetup option, if any
    pub fn systemd_option(self) -> Option<&'static str> {
        match self {
            Self::IoError => None,
            Self::Ignore => Some("ignore-corruption"),
            Self::Panic => Some("panic-on-corruption"),
            Self::Restart => Some("restart-on-corruption"),
        }
    }
}

/// Contents of `systemd.verity_root_options=`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerityOptions {
    pub corruption: CorruptionOption,
    pub hash_signature_path: Option<String>,
}

impl VerityOptions {
    pub fn parse(text: &str) -> Result<Self> {
        let mut options = VerityOptions::default();

        for option in text.split(',') {
            match option {
                "" => {}
                "ignore-corruption" => options.corruption = CorruptionOption::Ignore,
                "panic-on-corruption" => options.corruption = CorruptionOption::Panic,
                "restart-on-corruption" => options.corruption = CorruptionOption::Restart,
                other => match other.strip_prefix("root-hash-signature=") {
                    Some(path) => options.hash_signature_path = Some(path.to_string()),
                    None => return Err(TypesError::InvalidVerityOption(other.to_string())),
                },
            }
        }

        Ok(options)
    }

    pub fn to_systemd_string(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(option) = self.corruption.systemd_option() {
            parts.push(option.to_string());
        }
        if let Some(path) = &self.hash_signature_path {
            parts.push(format!("root-hash-signature={path}"));
        }
        parts.join(",")
    }
}

/// A dm-verity device discovered on (or configured for) an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerityDeviceMetadata {
    /// Device-mapper name ("root" or "usr")
    pub name: String,
    pub data_partition: Partition,
    pub hash_partition: Partition,
    pub root_hash: String,
    pub read_only: bool,
    pub data_id_type: MountIdType,
    pub hash_id_type: MountIdType,
    pub options: VerityOptions,
}

/// Size of the on-disk dm-verity superblock
pub const VERITY_SUPERBLOCK_SIZE: usize = 512;

const VERITY_SIGNATURE: &[u8; 8] = b"verity\0\0";

/// The dm-verity superblock at the start of a hash partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VeritySuperblock {
    pub version: u32,
    pub hash_type: u32,
    pub uuid: [u8; 16],
    pub algorithm: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub salt_size: u16,
}

impl VeritySuperblock {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VERITY_SUPERBLOCK_SIZE {
            return Err(TypesError::VeritySuperblockInvalid(format!(
                "short read ({} bytes)",
                bytes.len()
            )));
        }

        if &bytes[0..8] != VERITY_SIGNATURE {
            return Err(TypesError::VeritySuperblockInvalid(
                "wrong signature".to_string(),
            ));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[16..32]);

        let algorithm_field = &bytes[32..64];
        let algorithm_len = algorithm_field
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(algorithm_field.len());
        let algorithm = String::from_utf8_lossy(&algorithm_field[..algorithm_len]).to_string();

        let superblock = Self {
            version: read_u32(bytes, 8),
            hash_type: read_u32(bytes, 12),
            uuid,
            algorithm,
            data_block_size: read_u32(bytes, 64),
            hash_block_size: read_u32(bytes, 68),
            data_blocks: read_u64(bytes, 72),
            salt_size: u16::from_le_bytes([bytes[80], bytes[81]]),
        };

        if superblock.version != 1 {
            return Err(TypesError::VeritySuperblockInvalid(format!(
                "unsupported version ({})",
                superblock.version
            )));
        }

        if superblock.hash_type != 1 {
            return Err(TypesError::VeritySuperblockInvalid(format!(
                "unsupported hash type ({})",
                superblock.hash_type
            )));
        }

        Ok(superblock)
    }

    pub fn hash_size(&self) -> Result<u32> {
        match self.algorithm.as_str() {
            "sha256" => Ok(32),
            "sha384" => Ok(48),
            "sha512" => Ok(64),
            other => Err(TypesError::VeritySuperblockInvalid(format!(
                "unknown hash algorithm ({other})"
            ))),
        }
    }

    /// Bytes used on the hash partition by the superblock plus hash tree
    pub fn hash_tree_size_bytes(&self) -> Result<u64> {
        hash_tree_size_bytes(
            self.data_blocks,
            self.data_block_size,
            self.hash_block_size,
            self.hash_size()?,
        )
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buffer = [0u8; 4];
    buffer.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buffer)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buffer)
}

/// Size of a dm-verity hash tree, including its superblock block.
///
/// Each hash is padded up to a power of two before packing into hash blocks.
pub fn hash_tree_size_bytes(
    data_blocks: u64,
    data_block_size: u32,
    hash_block_size: u32,
    hash_size: u32,
) -> Result<u64> {
    if !data_block_size.is_power_of_two() {
        return Err(TypesError::VeritySuperblockInvalid(format!(
            "invalid data block size ({data_block_size})"
        )));
    }

    if !hash_block_size.is_power_of_two() || hash_block_size < hash_size {
        return Err(TypesError::VeritySuperblockInvalid(format!(
            "invalid hash block size ({hash_block_size})"
        )));
    }

    let padded_hash_size = hash_size.max(1).next_power_of_two();
    let hashes_per_block = u64::from(hash_block_size / padded_hash_size);

    let mut tree_blocks = 0u64;
    let mut level_blocks = data_blocks;
    while level_blocks > 1 {
        level_blocks = level_blocks.div_ceil(hashes_per_block);
        tree_blocks += level_blocks;
    }

    Ok((tree_blocks + 1) * u64::from(hash_block_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock_bytes(algorithm: &str, data_blocks: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; VERITY_SUPERBLOCK_SIZE];
        bytes[0..8].copy_from_slice(VERITY_SIGNATURE);
        bytes[8..12].copy_from_slice(&1u32.to_le_bytes());
        bytes[12..16].copy_from_slice(&1u32.to_le_bytes());
        bytes[32..32 + algorithm.len()].copy_from_slice(algorithm.as_bytes());
        bytes[64..68].copy_from_slice(&4096u32.to_le_bytes());
        bytes[68..72].copy_from_slice(&4096u32.to_le_bytes());
        bytes[72..80].copy_from_slice(&data_blocks.to_le_bytes());
        bytes[80..82].copy_from_slice(&32u16.to_le_bytes());
        bytes
    }

    #[test]
    fn parses_superblock_fields() {
        let superblock = VeritySuperblock::parse(&superblock_bytes("sha256", 1000)).unwrap();
        assert_eq!(superblock.algorithm, "sha256");
        assert_eq!(superblock.data_blocks, 1000);
        assert_eq!(superblock.salt_size, 32);
        assert_eq!(superblock.hash_size().unwrap(), 32);
    }

    #[test]
    fn rejects_bad_signature_and_version() {
        let mut bytes = superblock_bytes("sha256", 1);
        bytes[0] = b'x';
        assert!(VeritySuperblock::parse(&bytes).is_err());

        let mut bytes = superblock_bytes("sha256", 1);
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
        assert!(VeritySuperblock::parse(&bytes).is_err());

        assert!(VeritySuperblock::parse(&bytes[..100]).is_err());
    }

    #[test]
    fn computes_hash_tree_size() {
        // 128 sha256 hashes per 4 KiB block: 1000 -> 8 -> 1 blocks, plus superblock.
        let superblock = VeritySuperblock::parse(&superblock_bytes("sha256", 1000)).unwrap();
        assert_eq!(superblock.hash_tree_size_bytes().unwrap(), (8 + 1 + 1) * 4096);

        // sha384 pads to 64 bytes: 64 hashes per block.
        assert_eq!(hash_tree_size_bytes(64, 4096, 4096, 48).unwrap(), 2 * 4096);
        assert_eq!(hash_tree_size_bytes(65, 4096, 4096, 48).unwrap(), 4 * 4096);

        assert!(hash_tree_size_bytes(10, 4000, 4096, 32).is_err());
        assert!(hash_tree_size_bytes(10, 4096, 16, 32).is_err());
    }

    #[test]
    fn verity_options_round_trip() {
        let options = VerityOptions::parse("panic-on-corruption,root-hash-signature=/boot/root.p7s")
            .unwrap();
        assert_eq!(options.corruption, CorruptionOption::Panic);
        assert_eq!(options.hash_signature_path.as_deref(), Some("/boot/root.p7s"));
        assert_eq!(
            options.to_systemd_string(),
            "panic-on-corruption,root-hash-signature=/boot/root.p7s"
        );

        assert_eq!(VerityOptions::parse("").unwrap(), VerityOptions::default());
        assert!(VerityOptions::parse("bogus").is_err());
    }
}
