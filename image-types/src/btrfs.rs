// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::common::DiskSize;
use crate::error::{Result, TypesError};

/// Prefix `btrfs subvolume list -a` puts on paths below the top-level tree
pub const FS_TREE_PREFIX: &str = "<FS_TREE>/";

pub fn strip_fs_tree_prefix(path: &str) -> &str {
    path.strip_prefix(FS_TREE_PREFIX).unwrap_or(path)
}

/// Quota group limits for a subvolume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsQuota {
    pub referenced_limit: Option<DiskSize>,
    pub exclusive_limit: Option<DiskSize>,
}

impl BtrfsQuota {
    pub fn is_empty(&self) -> bool {
        self.referenced_limit.is_none() && self.exclusive_limit.is_none()
    }
}

/// A subvolume declared in a disk layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsSubvolumeConfig {
    /// Slash separated, relative to the top-level subvolume
    pub path: String,
    #[serde(default)]
    pub mount_point: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub quota: Option<BtrfsQuota>,
}

impl BtrfsSubvolumeConfig {
    pub fn validate(&self) -> Result<()> {
        validate_subvolume_path(&self.path)?;

        for option in &self.options {
            if option.starts_with("subvol=") || option.starts_with("subvolid=") {
                return Err(TypesError::InvalidSubvolumePath {
                    path: self.path.clone(),
                    reason: format!("mount option '{option}' selects the subvolume itself"),
                });
            }
        }

        if let Some(mount_point) = &self.mount_point
            && !mount_point.starts_with('/')
        {
            return Err(TypesError::InvalidSubvolumePath {
                path: self.path.clone(),
                reason: format!("mount point '{mount_point}' is not absolute"),
            });
        }

        Ok(())
    }
}

pub fn validate_subvolume_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| TypesError::InvalidSubvolumePath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.starts_with('/') {
        return Err(invalid("path must be relative"));
    }
    if path.ends_with('/') {
        return Err(invalid("path has a trailing slash"));
    }
    if path.contains("//") {
        return Err(invalid("path contains an empty component"));
    }
    if path.split('/').any(|component| component == "." || component == "..") {
        return Err(invalid("path contains '.' or '..'"));
    }

    Ok(())
}

/// Subvolumes of one btrfs filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtrfsConfig {
    #[serde(default)]
    pub subvolumes: Vec<BtrfsSubvolumeConfig>,
}

impl BtrfsConfig {
    pub fn validate(&self) -> Result<()> {
        let mut paths = HashSet::new();
        let mut mount_points = HashSet::new();

        for subvolume in &self.subvolumes {
            subvolume.validate()?;

            if !paths.insert(subvolume.path.as_str()) {
                return Err(TypesError::InvalidSubvolumePath {
                    path: subvolume.path.clone(),
                    reason: "declared more than once".to_string(),
                });
            }

            if let Some(mount_point) = &subvolume.mount_point
                && !mount_points.insert(mount_point.as_str())
            {
                return Err(TypesError::InvalidSubvolumePath {
                    path: subvolume.path.clone(),
                    reason: format!("mount point '{mount_point}' is used more than once"),
                });
            }
        }

        Ok(())
    }

    /// Subvolumes in creation order.
    ///
    /// A parent path is a prefix of its children, so plain lexicographic order
    /// puts every parent first.
    pub fn creation_order(&self) -> Vec<&BtrfsSubvolumeConfig> {
        let mut ordered: Vec<&BtrfsSubvolumeConfig> = self.subvolumes.iter().collect();
        ordered.sort_by(|left, right| left.path.cmp(&right.path));
        ordered
    }

    pub fn has_quotas(&self) -> bool {
        self.subvolumes
            .iter()
            .any(|subvolume| subvolume.quota.as_ref().is_some_and(|quota| !quota.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subvolume(path: &str) -> BtrfsSubvolumeConfig {
        BtrfsSubvolumeConfig {
            path: path.to_string(),
            mount_point: None,
            options: Vec::new(),
            quota: None,
        }
    }

    #[test]
    fn strips_fs_tree_prefix_only_when_present() {
        assert_eq!(strip_fs_tree_prefix("<FS_TREE>/root"), "root");
        assert_eq!(strip_fs_tree_prefix("@home"), "@home");
        assert_eq!(strip_fs_tree_prefix("a/<FS_TREE>/b"), "a/<FS_TREE>/b");
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "/root", "root/", "a//b", "a/./b", "../a", "a/.."] {
            assert!(validate_subvolume_path(path).is_err(), "{path} should be rejected");
        }
        for path in ["root", "@home", "var/log", "a.b/c..d"] {
            assert!(validate_subvolume_path(path).is_ok(), "{path} should be accepted");
        }
    }

    #[test]
    fn rejects_subvolume_selecting_options() {
        let mut config = subvolume("home");
        config.options = vec!["compress=zstd".to_string(), "subvolid=256".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicates() {
        let config = BtrfsConfig {
            subvolumes: vec![subvolume("root"), subvolume("root")],
        };
        assert!(config.validate().is_err());

        let mut first = subvolume("a");
        first.mount_point = Some("/data".to_string());
        let mut second = subvolume("b");
        second.mount_point = Some("/data".to_string());
        let config = BtrfsConfig {
            subvolumes: vec![first, second],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn orders_parents_before_children() {
        let config = BtrfsConfig {
            subvolumes: vec![
                subvolume("var/log"),
                subvolume("home/user"),
                subvolume("var"),
                subvolume("home"),
            ],
        };
        let order: Vec<&str> = config
            .creation_order()
            .iter()
            .map(|subvolume| subvolume.path.as_str())
            .collect();
        assert_eq!(order, vec!["home", "home/user", "var", "var/log"]);

        let sorted = BtrfsConfig {
            subvolumes: order.iter().map(|path| subvolume(path)).collect(),
        };
        let again: Vec<&str> = sorted
            .creation_order()
            .iter()
            .map(|subvolume| subvolume.path.as_str())
            .collect();
        assert_eq!(again, order);
    }
}
