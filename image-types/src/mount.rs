// SPDX-License-Identifier: GPL-3.0-only

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

/// Kernel mount flags understood in fstab option lists.
///
/// Discriminants equal the Linux `MS_*` values so the bitset can be handed to
/// `mount(2)` unchanged.
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MountFlag {
    ReadOnly = 1,
    NoSuid = 1 << 1,
    NoDev = 1 << 2,
    NoExec = 1 << 3,
    Synchronous = 1 << 4,
    DirSync = 1 << 7,
    NoAtime = 1 << 10,
    NoDirAtime = 1 << 11,
    Bind = 1 << 12,
    RelAtime = 1 << 21,
    StrictAtime = 1 << 24,
    LazyTime = 1 << 25,
}

pub type MountFlags = BitFlags<MountFlag>;

/// Fstab options split by who consumes them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMountOptions {
    /// Options turned into `mount(2)` flags
    pub flags: MountFlags,
    /// Options passed to the filesystem as data, in input order
    pub data: Vec<String>,
    /// Value of a `subvol=` option
    pub subvolume: Option<String>,
}

impl ParsedMountOptions {
    pub fn data_string(&self) -> String {
        self.data.join(",")
    }
}

pub fn parse_mount_options<S: AsRef<str>>(options: &[S]) -> ParsedMountOptions {
    let mut parsed = ParsedMountOptions::default();

    for option in options.iter().map(AsRef::as_ref) {
        match option {
            "ro" => parsed.flags.insert(MountFlag::ReadOnly),
            "rw" => parsed.flags.remove(MountFlag::ReadOnly),
            "nosuid" => parsed.flags.insert(MountFlag::NoSuid),
            "suid" => parsed.flags.remove(MountFlag::NoSuid),
            "nodev" => parsed.flags.insert(MountFlag::NoDev),
            "dev" => parsed.flags.remove(MountFlag::NoDev),
            "noexec" => parsed.flags.insert(MountFlag::NoExec),
            "exec" => parsed.flags.remove(MountFlag::NoExec),
            "sync" => parsed.flags.insert(MountFlag::Synchronous),
            "async" => parsed.flags.remove(MountFlag::Synchronous),
            "dirsync" => parsed.flags.insert(MountFlag::DirSync),
            "noatime" => parsed.flags.insert(MountFlag::NoAtime),
            "atime" => parsed.flags.remove(MountFlag::NoAtime),
            "nodiratime" => parsed.flags.insert(MountFlag::NoDirAtime),
            "diratime" => parsed.flags.remove(MountFlag::NoDirAtime),
            "relatime" => parsed.flags.insert(MountFlag::RelAtime),
            "norelatime" => parsed.flags.remove(MountFlag::RelAtime),
            "strictatime" => parsed.flags.insert(MountFlag::StrictAtime),
            "lazytime" => parsed.flags.insert(MountFlag::LazyTime),
            "bind" => parsed.flags.insert(MountFlag::Bind),
            option if is_userspace_option(option) => {}
            option => {
                if let Some(subvolume) = option.strip_prefix("subvol=") {
                    parsed.subvolume = Some(subvolume.to_string());
                } else {
                    parsed.data.push(option.to_string());
                }
            }
        }
    }

    parsed
}

// Consumed by mount(8)/systemd, never by the kernel.
fn is_userspace_option(option: &str) -> bool {
    matches!(
        option,
        "defaults" | "auto" | "noauto" | "nofail" | "user" | "nouser" | "users" | "owner"
            | "group" | "_netdev"
    ) || option.starts_with("x-")
        || option.starts_with("comment=")
}

/// A resolved mount operation in a chroot mount plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Absolute path inside the chroot
    pub target: String,
    pub source_device: String,
    pub fs_type: String,
    pub flags: MountFlags,
    /// Filesystem data options, comma separated
    pub data: String,
    pub subvolume: Option<String>,
    pub read_only: bool,
    pub is_verity_root: bool,
}

impl MountSpec {
    pub fn effective_flags(&self) -> MountFlags {
        if self.read_only {
            self.flags | MountFlag::ReadOnly
        } else {
            self.flags
        }
    }

    /// Data string handed to `mount(2)`, including the subvolume selector
    pub fn effective_data(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(subvolume) = &self.subvolume {
            parts.push(format!("subvol={subvolume}"));
        }
        if !self.data.is_empty() {
            parts.push(self.data.clone());
        }
        parts.join(",")
    }
}
