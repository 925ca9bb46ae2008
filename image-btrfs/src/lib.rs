// SPDX-License-Identifier: GPL-3.0-only

//! BTRFS operations for disk image builds
//!
//! Subvolumes are listed through the `btrfs` CLI, whose output is the only
//! stable contract, and created through `btrfsutil`. Quota limits are applied
//! with `btrfs quota` / `btrfs qgroup`.

pub mod error;
pub mod quota;
pub mod subvolume;

pub use error::{BtrfsError, Result};
pub use quota::{enable_quota, limit_qgroup};
pub use subvolume::{SubvolumeManager, parse_subvolume_list};
