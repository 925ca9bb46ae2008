// SPDX-License-Identifier: GPL-3.0-only

//! Mount plan construction
//!
//! A plan is the ordered list of mounts that assemble an image's filesystem
//! tree under a chroot directory. Entries are sorted by target string: an
//! ancestor path is a strict prefix of every descendant, so it always sorts
//! first and is mounted before anything beneath it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use image_types::{
    ExtendedSourceSpec, FstabEntry, MountFlag, MountFlags, MountSpec, Partition,
    parse_mount_options,
};

use crate::error::{EngineError, Result};
use crate::resolve::resolve_source;

/// Flags controlling how fstab entries become mounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanOptions {
    /// Mount every entry read-only
    pub read_only: bool,
    /// Mount the verity root read-only
    pub read_only_verity: bool,
    /// Append /dev, /proc, /sys, /run and /dev/pts after the fstab entries
    pub include_default_mounts: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            read_only_verity: false,
            include_default_mounts: true,
        }
    }
}

/// Turn fstab entries into an ordered mount plan.
///
/// `verity_data` is the data partition behind the verity root, when the
/// image has one.
pub fn build_mount_plan(
    entries: &[FstabEntry],
    partitions: &[Partition],
    verity_data: Option<&Partition>,
    options: PlanOptions,
) -> Result<Vec<MountSpec>> {
    let mut plan = Vec::new();

    for entry in entries {
        if entry.is_pseudo_filesystem() || entry.fs_type == "swap" {
            tracing::debug!(source = %entry.source, fs_type = %entry.fs_type, "skipping fstab entry");
            continue;
        }

        let spec = ExtendedSourceSpec::parse(&entry.source)?;
        let partition = resolve_source(&spec, partitions, verity_data).map_err(|failure| {
            EngineError::MountSourceUnresolved {
                spec: entry.source.clone(),
                target: entry.target.clone(),
                reason: failure.to_string(),
            }
        })?;

        let parsed = parse_mount_options(&entry.options);
        let is_verity_root = spec.is_verity_root();

        // The image is mounted to be modified, so fstab's own ro is dropped
        let mut flags = parsed.flags;
        flags.remove(MountFlag::ReadOnly);

        tracing::debug!(
            target = %entry.target,
            device = %partition.device_path,
            is_verity_root,
            "resolved mount"
        );

        plan.push(MountSpec {
            target: entry.target.clone(),
            source_device: partition.device_path.clone(),
            fs_type: entry.fs_type.clone(),
            flags,
            data: parsed.data_string(),
            subvolume: parsed.subvolume,
            read_only: options.read_only || (is_verity_root && options.read_only_verity),
            is_verity_root,
        });
    }

    check_targets(&plan)?;
    sort_by_target(&mut plan);

    if options.include_default_mounts {
        plan.extend(default_mounts());
    }

    Ok(plan)
}

fn check_targets(plan: &[MountSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in plan {
        if !seen.insert(spec.target.as_str()) {
            return Err(EngineError::DuplicateMountTarget {
                target: spec.target.clone(),
            });
        }
    }

    if !seen.contains("/") {
        return Err(EngineError::RootMountMissing);
    }
    Ok(())
}

/// Stable lexicographic sort on the target path
pub fn sort_by_target(plan: &mut [MountSpec]) {
    plan.sort_by(|a, b| a.target.cmp(&b.target));
}

/// Kernel filesystems every chroot needs, in mount order
pub fn default_mounts() -> Vec<MountSpec> {
    let virtual_mount = |target: &str, fs_type: &str, flags: MountFlags, data: &str| MountSpec {
        target: target.to_string(),
        source_device: fs_type.to_string(),
        fs_type: fs_type.to_string(),
        flags,
        data: data.to_string(),
        subvolume: None,
        read_only: false,
        is_verity_root: false,
    };

    vec![
        virtual_mount("/dev", "devtmpfs", MountFlags::empty(), ""),
        virtual_mount(
            "/proc",
            "proc",
            MountFlag::NoSuid | MountFlag::NoDev | MountFlag::NoExec,
            "",
        ),
        virtual_mount(
            "/sys",
            "sysfs",
            MountFlag::NoSuid | MountFlag::NoDev | MountFlag::NoExec,
            "",
        ),
        virtual_mount("/run", "tmpfs", MountFlag::NoSuid | MountFlag::NoDev, ""),
        virtual_mount(
            "/dev/pts",
            "devpts",
            MountFlag::NoSuid | MountFlag::NoExec,
            "gid=5,mode=620",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(index: u32, fs_type: &str, fs_uuid: &str) -> Partition {
        Partition {
            index,
            device_path: format!("/dev/loop0p{index}"),
            part_uuid: format!("0000000{index}-0000-0000-0000-000000000000"),
            fs_type: fs_type.to_string(),
            fs_uuid: fs_uuid.to_string(),
            ..Default::default()
        }
    }

    fn entry(source: &str, target: &str, fs_type: &str, options: &[&str]) -> FstabEntry {
        FstabEntry {
            options: options.iter().map(ToString::to_string).collect(),
            ..FstabEntry::new(source, target, fs_type)
        }
    }

    fn targets(plan: &[MountSpec]) -> Vec<&str> {
        plan.iter().map(|spec| spec.target.as_str()).collect()
    }

    const NO_DEFAULTS: PlanOptions = PlanOptions {
        read_only: false,
        read_only_verity: false,
        include_default_mounts: false,
    };

    #[test]
    fn parents_sort_before_children() {
        let partitions = vec![
            partition(1, "ext4", "a"),
            partition(2, "vfat", "b"),
            partition(3, "xfs", "c"),
            partition(4, "ext4", "d"),
        ];
        let entries = vec![
            entry("UUID=a", "/", "ext4", &["defaults"]),
            entry("UUID=b", "/boot/efi", "vfat", &["defaults"]),
            entry("UUID=c", "/var/log", "xfs", &["defaults"]),
            entry("UUID=d", "/boot", "ext4", &["defaults"]),
        ];

        let plan = build_mount_plan(&entries, &partitions, None, NO_DEFAULTS).unwrap();
        assert_eq!(targets(&plan), ["/", "/boot", "/boot/efi", "/var/log"]);

        let mut sorted = plan.clone();
        sort_by_target(&mut sorted);
        assert_eq!(sorted, plan);
    }

    #[test]
    fn pseudo_and_swap_entries_are_skipped() {
        let partitions = vec![partition(1, "ext4", "a"), partition(2, "swap", "s")];
        let entries = vec![
            entry("UUID=a", "/", "ext4", &["defaults"]),
            entry("tmpfs", "/tmp", "tmpfs", &["defaults"]),
            entry("proc", "/proc", "proc", &["defaults"]),
            entry("UUID=s", "none", "swap", &["sw"]),
        ];

        let plan = build_mount_plan(&entries, &partitions, None, NO_DEFAULTS).unwrap();
        assert_eq!(targets(&plan), ["/"]);
    }

    #[test]
    fn fstab_read_only_is_cleared() {
        let partitions = vec![partition(1, "ext4", "a")];
        let entries = vec![entry("UUID=a", "/", "ext4", &["ro", "noatime", "errors=remount-ro"])];

        let plan = build_mount_plan(&entries, &partitions, None, NO_DEFAULTS).unwrap();
        assert!(!plan[0].read_only);
        assert!(!plan[0].flags.contains(MountFlag::ReadOnly));
        assert!(plan[0].flags.contains(MountFlag::NoAtime));
        assert_eq!(plan[0].data, "errors=remount-ro");

        let read_only = PlanOptions {
            read_only: true,
            ..NO_DEFAULTS
        };
        let plan = build_mount_plan(&entries, &partitions, None, read_only).unwrap();
        assert!(plan[0].read_only);
        assert!(plan[0].effective_flags().contains(MountFlag::ReadOnly));
    }

    #[test]
    fn verity_root_maps_to_data_partition() {
        let partitions = vec![partition(1, "vfat", "esp"), partition(2, "ext4", "data")];
        let entries = vec![
            entry("/dev/mapper/root", "/", "ext4", &["ro"]),
            entry("UUID=esp", "/boot/efi", "vfat", &["umask=0077"]),
        ];
        let options = PlanOptions {
            read_only_verity: true,
            ..NO_DEFAULTS
        };

        let plan = build_mount_plan(&entries, &partitions, Some(&partitions[1]), options).unwrap();
        assert_eq!(plan[0].source_device, "/dev/loop0p2");
        assert!(plan[0].is_verity_root);
        assert!(plan[0].read_only);
        assert!(!plan[1].read_only);

        let error = build_mount_plan(&entries, &partitions, None, options).unwrap_err();
        assert!(matches!(error, EngineError::MountSourceUnresolved { ref target, .. } if target == "/"));
    }

    #[test]
    fn subvolume_is_lifted_out_of_options() {
        let partitions = vec![partition(1, "btrfs", "fs")];
        let entries = vec![
            entry("UUID=fs", "/", "btrfs", &["subvol=root", "compress=zstd"]),
            entry("UUID=fs", "/home", "btrfs", &["subvol=home"]),
        ];

        let plan = build_mount_plan(&entries, &partitions, None, NO_DEFAULTS).unwrap();
        assert_eq!(plan[0].subvolume.as_deref(), Some("root"));
        assert_eq!(plan[0].effective_data(), "subvol=root,compress=zstd");
        assert_eq!(plan[1].effective_data(), "subvol=home");
    }

    #[test]
    fn unresolvable_sources_fail() {
        let partitions = vec![partition(1, "ext4", "a")];

        let missing = vec![
            entry("UUID=a", "/", "ext4", &["defaults"]),
            entry("UUID=nope", "/data", "ext4", &["defaults"]),
        ];
        let error = build_mount_plan(&missing, &partitions, None, NO_DEFAULTS).unwrap_err();
        assert!(matches!(
            error,
            EngineError::MountSourceUnresolved { ref spec, ref reason, .. }
                if spec == "UUID=nope" && reason == "partition not found"
        ));

        let garbage = vec![entry("rootfs", "/", "ext4", &["defaults"])];
        assert!(matches!(
            build_mount_plan(&garbage, &partitions, None, NO_DEFAULTS),
            Err(EngineError::Types(_))
        ));
    }

    #[test]
    fn root_must_appear_exactly_once() {
        let partitions = vec![partition(1, "ext4", "a"), partition(2, "ext4", "b")];

        let no_root = vec![entry("UUID=a", "/data", "ext4", &["defaults"])];
        assert!(matches!(
            build_mount_plan(&no_root, &partitions, None, NO_DEFAULTS),
            Err(EngineError::RootMountMissing)
        ));

        let two_roots = vec![
            entry("UUID=a", "/", "ext4", &["defaults"]),
            entry("UUID=b", "/", "ext4", &["defaults"]),
        ];
        assert!(matches!(
            build_mount_plan(&two_roots, &partitions, None, NO_DEFAULTS),
            Err(EngineError::DuplicateMountTarget { ref target }) if target == "/"
        ));
    }

    #[test]
    fn default_mounts_follow_real_entries() {
        let partitions = vec![partition(1, "ext4", "a"), partition(2, "ext4", "v")];
        let entries = vec![
            entry("UUID=v", "/var", "ext4", &["defaults"]),
            entry("UUID=a", "/", "ext4", &["defaults"]),
        ];

        let plan = build_mount_plan(&entries, &partitions, None, PlanOptions::default()).unwrap();
        assert_eq!(
            targets(&plan),
            ["/", "/var", "/dev", "/proc", "/sys", "/run", "/dev/pts"]
        );
        assert_eq!(plan[6].data, "gid=5,mode=620");
    }
}
