// SPDX-License-Identifier: GPL-3.0-only

//! In-memory host for exercising the engine without block devices.
//!
//! Filesystem contents are stored per `(device, subvolume)`. A mount copies
//! the stored files into the target directory; a read-write unmount copies
//! them back, and every unmount empties the target again.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use image_btrfs::BtrfsError;
use image_engine::{
    AttachedDevice, EngineConfig, FilesystemOps, LoopOps, MountHandle, PartitionOps, SubvolumeOps,
};
use image_sys::{FilesystemProbe, MountRequest, RawPartition, RawPartitionTable, SysError};
use image_types::{MountFlag, PartitionTableType, VeritySuperblock, partition_device_path};

pub const MIB: u64 = 1 << 20;
pub const LOOP_DEVICE: &str = "/dev/loop7";
pub const ROOT_HASH: &str = "4d3c2b1a00ff00ff4d3c2b1a00ff00ff4d3c2b1a00ff00ff4d3c2b1a00ff00ff";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Engine settings rooted in a private temporary directory
pub fn test_config(build_dir: &Path) -> EngineConfig {
    EngineConfig {
        build_dir: build_dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

type FsKey = (String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device: String,
    pub target: PathBuf,
    pub fs_type: String,
    pub data: String,
    pub read_only: bool,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, RawPartitionTable>,
    probes: HashMap<String, FilesystemProbe>,
    files: HashMap<FsKey, BTreeMap<PathBuf, String>>,
    subvolumes: HashMap<String, Vec<String>>,
    failing_devices: HashSet<String>,
    active: HashMap<PathBuf, String>,
    superblock: Option<VeritySuperblock>,
    mounts: Vec<MountRecord>,
    unmounts: Vec<PathBuf>,
    scripts: Vec<(String, String)>,
    formatted: Vec<(String, String)>,
    verity_formatted: Vec<(String, String)>,
    created_subvolumes: Vec<(String, String)>,
    quota_enabled: Vec<String>,
    qgroup_limits: Vec<(String, u64, bool)>,
    detached: Vec<String>,
    next_uuid: u32,
}

impl State {
    fn fresh_uuid(&mut self, prefix: &str) -> String {
        self.next_uuid += 1;
        format!("{prefix}-{:04}", self.next_uuid)
    }
}

/// Subvolume selected by a mount data string; empty for the top level
fn subvolume_key(data: &str) -> String {
    data.split(',')
        .find_map(|option| option.strip_prefix("subvol="))
        .map(|path| path.trim_start_matches('/').to_string())
        .unwrap_or_default()
}

fn collect_files(root: &Path, dir: &Path, found: &mut BTreeMap<PathBuf, String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, found);
        } else if let (Ok(relative), Ok(text)) = (path.strip_prefix(root), fs::read_to_string(&path)) {
            found.insert(relative.to_path_buf(), text);
        }
    }
}

fn clear_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).unwrap();
        } else {
            fs::remove_file(&path).unwrap();
        }
    }
}

/// Partition description used to seed a fake disk
#[derive(Debug, Clone, Default)]
pub struct FakePartition {
    pub start_mib: u64,
    pub size_mib: u64,
    pub type_id: String,
    pub part_uuid: String,
    pub name: String,
    pub fs_type: String,
    pub fs_uuid: String,
    pub fs_label: String,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Rc<RefCell<State>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a GPT table on `disk` and return the partition nodes
    pub fn add_disk(&self, disk: &str, partitions: &[FakePartition]) -> Vec<String> {
        let mut state = self.state.borrow_mut();
        let mut raw = Vec::new();

        for (position, partition) in partitions.iter().enumerate() {
            let number = position as u32 + 1;
            let node = partition_device_path(disk, number);
            raw.push(RawPartition {
                number,
                node: node.clone(),
                start_bytes: partition.start_mib * MIB,
                size_bytes: partition.size_mib * MIB,
                type_id: partition.type_id.clone(),
                part_uuid: partition.part_uuid.clone(),
                name: partition.name.clone(),
            });
            state.probes.insert(
                node,
                FilesystemProbe {
                    fs_type: partition.fs_type.clone(),
                    uuid: partition.fs_uuid.clone(),
                    label: partition.fs_label.clone(),
                },
            );
        }

        let nodes = raw.iter().map(|partition| partition.node.clone()).collect();
        state.tables.insert(
            disk.to_string(),
            RawPartitionTable {
                device: disk.to_string(),
                table_type: PartitionTableType::Gpt,
                sector_size: 512,
                partitions: raw,
            },
        );
        nodes
    }

    /// Store a file in the filesystem of `device` (optionally inside `subvolume`)
    pub fn put_file(&self, device: &str, subvolume: &str, path: &str, contents: &str) {
        self.state
            .borrow_mut()
            .files
            .entry((device.to_string(), subvolume.to_string()))
            .or_default()
            .insert(PathBuf::from(path), contents.to_string());
    }

    pub fn file(&self, device: &str, subvolume: &str, path: &str) -> Option<String> {
        self.state
            .borrow()
            .files
            .get(&(device.to_string(), subvolume.to_string()))
            .and_then(|files| files.get(Path::new(path)).cloned())
    }

    pub fn add_subvolume(&self, device: &str, path: &str) {
        self.state
            .borrow_mut()
            .subvolumes
            .entry(device.to_string())
            .or_default()
            .push(path.to_string());
    }

    pub fn fail_mounts_of(&self, device: &str) {
        self.state.borrow_mut().failing_devices.insert(device.to_string());
    }

    pub fn set_superblock(&self, superblock: VeritySuperblock) {
        self.state.borrow_mut().superblock = Some(superblock);
    }

    pub fn mounts(&self) -> Vec<MountRecord> {
        self.state.borrow().mounts.clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        self.state.borrow().unmounts.clone()
    }

    pub fn active_mounts(&self) -> usize {
        self.state.borrow().active.len()
    }

    pub fn scripts(&self) -> Vec<(String, String)> {
        self.state.borrow().scripts.clone()
    }

    pub fn formatted(&self) -> Vec<(String, String)> {
        self.state.borrow().formatted.clone()
    }

    pub fn verity_formatted(&self) -> Vec<(String, String)> {
        self.state.borrow().verity_formatted.clone()
    }

    pub fn created_subvolumes(&self) -> Vec<(String, String)> {
        self.state.borrow().created_subvolumes.clone()
    }

    pub fn quota_enabled(&self) -> Vec<String> {
        self.state.borrow().quota_enabled.clone()
    }

    pub fn qgroup_limits(&self) -> Vec<(String, u64, bool)> {
        self.state.borrow().qgroup_limits.clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.state.borrow().detached.clone()
    }

    fn mounted_device(&self, mount_point: &Path) -> image_btrfs::Result<String> {
        self.state
            .borrow()
            .active
            .get(mount_point)
            .cloned()
            .ok_or_else(|| BtrfsError::NotMounted(mount_point.display().to_string()))
    }
}

/// Default superblock of a small sha256 hash tree
pub fn small_superblock() -> VeritySuperblock {
    VeritySuperblock {
        version: 1,
        hash_type: 1,
        uuid: [7; 16],
        algorithm: "sha256".to_string(),
        data_block_size: 4096,
        hash_block_size: 4096,
        data_blocks: 1024,
        salt_size: 32,
    }
}

/// Parse the `start=..., size=...` lines of an sfdisk script
fn script_partitions(disk: &str, script: &str) -> Vec<RawPartition> {
    script
        .lines()
        .filter(|line| line.starts_with("start="))
        .enumerate()
        .map(|(position, line)| {
            let mut partition = RawPartition {
                number: position as u32 + 1,
                node: partition_device_path(disk, position as u32 + 1),
                ..Default::default()
            };
            for field in line.split(", ") {
                let Some((key, value)) = field.split_once('=') else {
                    continue;
                };
                let mib = || value.trim_end_matches("MiB").parse::<u64>().unwrap_or(0) * MIB;
                match key {
                    "start" => partition.start_bytes = mib(),
                    "size" => partition.size_bytes = mib(),
                    "type" => partition.type_id = value.to_string(),
                    "uuid" => partition.part_uuid = value.to_string(),
                    "name" => partition.name = value.trim_matches('"').replace("\\x22", "\""),
                    _ => {}
                }
            }
            partition
        })
        .collect()
}

impl PartitionOps for FakeBackend {
    fn read_table(&self, device: &str) -> image_sys::Result<RawPartitionTable> {
        self.state
            .borrow()
            .tables
            .get(device)
            .cloned()
            .ok_or_else(|| SysError::CommandFailed {
                command: format!("sfdisk --dump --json {device}"),
                stderr: "does not contain a recognized partition table".to_string(),
            })
    }

    fn probe(&self, device: &str) -> image_sys::Result<FilesystemProbe> {
        Ok(self.state.borrow().probes.get(device).cloned().unwrap_or_default())
    }

    fn write_table(&self, device: &str, script: &str) -> image_sys::Result<()> {
        let mut state = self.state.borrow_mut();
        state.scripts.push((device.to_string(), script.to_string()));

        let partitions = script_partitions(device, script);
        for partition in &partitions {
            state.probes.remove(&partition.node);
        }
        state.tables.insert(
            device.to_string(),
            RawPartitionTable {
                device: device.to_string(),
                table_type: PartitionTableType::Gpt,
                sector_size: 512,
                partitions,
            },
        );
        Ok(())
    }
}

struct FakeMount {
    state: Rc<RefCell<State>>,
    target: PathBuf,
    key: FsKey,
    read_only: bool,
    released: bool,
}

impl FakeMount {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.state.borrow_mut();
        if !self.read_only {
            let mut files = BTreeMap::new();
            collect_files(&self.target, &self.target, &mut files);
            state.files.insert(self.key.clone(), files);
        }
        clear_dir(&self.target);
        state.active.remove(&self.target);
        state.unmounts.push(self.target.clone());
    }
}

impl MountHandle for FakeMount {
    fn target(&self) -> &Path {
        &self.target
    }

    fn unmount(mut self: Box<Self>) -> image_sys::Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for FakeMount {
    fn drop(&mut self) {
        self.release();
    }
}

impl FilesystemOps for FakeBackend {
    fn mount(&self, request: &MountRequest<'_>) -> image_sys::Result<Box<dyn MountHandle>> {
        let mut state = self.state.borrow_mut();
        if state.failing_devices.contains(request.device) {
            return Err(SysError::CommandFailed {
                command: format!("mount {}", request.device),
                stderr: "wrong fs type, bad option, bad superblock".to_string(),
            });
        }

        let key = (request.device.to_string(), subvolume_key(request.data));
        if let Some(files) = state.files.get(&key) {
            for (relative, contents) in files {
                let path = request.target.join(relative);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, contents)?;
            }
        }

        let read_only = request.flags.contains(MountFlag::ReadOnly);
        state.mounts.push(MountRecord {
            device: request.device.to_string(),
            target: request.target.to_path_buf(),
            fs_type: request.fs_type.to_string(),
            data: request.data.to_string(),
            read_only,
        });
        state
            .active
            .insert(request.target.to_path_buf(), request.device.to_string());

        Ok(Box::new(FakeMount {
            state: Rc::clone(&self.state),
            target: request.target.to_path_buf(),
            key,
            read_only,
            released: false,
        }))
    }

    fn format(&self, device: &str, fs_type: &str) -> image_sys::Result<()> {
        let mut state = self.state.borrow_mut();
        state.formatted.push((device.to_string(), fs_type.to_string()));
        let uuid = state.fresh_uuid("fs");
        state.probes.insert(
            device.to_string(),
            FilesystemProbe {
                fs_type: fs_type.to_string(),
                uuid,
                label: String::new(),
            },
        );
        state.files.retain(|(owner, _), _| owner != device);
        state.subvolumes.remove(device);
        Ok(())
    }

    fn format_verity(&self, data_device: &str, hash_device: &str) -> image_sys::Result<String> {
        let mut state = self.state.borrow_mut();
        state
            .verity_formatted
            .push((data_device.to_string(), hash_device.to_string()));
        state.probes.insert(
            hash_device.to_string(),
            FilesystemProbe {
                fs_type: "DM_verity_hash".to_string(),
                ..Default::default()
            },
        );
        Ok(ROOT_HASH.to_string())
    }

    fn read_verity_superblock(&self, hash_device: &str) -> image_sys::Result<VeritySuperblock> {
        let state = self.state.borrow();
        let is_hash = state
            .probes
            .get(hash_device)
            .is_some_and(|probe| probe.fs_type == "DM_verity_hash");
        if !is_hash {
            return Err(SysError::InvalidData {
                path: PathBuf::from(hash_device),
                reason: "no verity superblock".to_string(),
            });
        }
        Ok(state.superblock.clone().unwrap_or_else(small_superblock))
    }
}

impl SubvolumeOps for FakeBackend {
    fn list_subvolumes(&self, mount_point: &Path) -> image_btrfs::Result<Vec<String>> {
        let device = self.mounted_device(mount_point)?;
        Ok(self
            .state
            .borrow()
            .subvolumes
            .get(&device)
            .cloned()
            .unwrap_or_default())
    }

    fn create_subvolume(&self, mount_point: &Path, path: &str) -> image_btrfs::Result<()> {
        let device = self.mounted_device(mount_point)?;
        let mut state = self.state.borrow_mut();

        let existing = state.subvolumes.entry(device.clone()).or_default();
        if let Some((parent, _)) = path.rsplit_once('/')
            && !existing.iter().any(|subvolume| subvolume == parent)
        {
            return Err(BtrfsError::CreateFailed {
                path: path.to_string(),
                reason: format!("parent subvolume '{parent}' does not exist"),
            });
        }
        existing.push(path.to_string());
        state.created_subvolumes.push((device, path.to_string()));
        Ok(())
    }

    fn enable_quota(&self, mount_point: &Path) -> image_btrfs::Result<()> {
        let device = self.mounted_device(mount_point)?;
        self.state.borrow_mut().quota_enabled.push(device);
        Ok(())
    }

    fn limit_qgroup(
        &self,
        mount_point: &Path,
        path: &str,
        limit_bytes: u64,
        exclusive: bool,
    ) -> image_btrfs::Result<()> {
        self.mounted_device(mount_point)?;
        self.state
            .borrow_mut()
            .qgroup_limits
            .push((path.to_string(), limit_bytes, exclusive));
        Ok(())
    }
}

struct FakeLoop {
    state: Rc<RefCell<State>>,
    device: String,
    released: bool,
}

impl AttachedDevice for FakeLoop {
    fn device_path(&self) -> &str {
        &self.device
    }

    fn detach(mut self: Box<Self>) -> image_sys::Result<()> {
        self.released = true;
        self.state.borrow_mut().detached.push(self.device.clone());
        Ok(())
    }
}

impl Drop for FakeLoop {
    fn drop(&mut self) {
        if !self.released {
            self.state.borrow_mut().detached.push(self.device.clone());
        }
    }
}

impl LoopOps for FakeBackend {
    fn attach(&self, image: &Path) -> image_sys::Result<Box<dyn AttachedDevice>> {
        if !image.exists() {
            return Err(SysError::CommandFailed {
                command: format!("losetup --find --show --partscan {}", image.display()),
                stderr: "No such file or directory".to_string(),
            });
        }
        Ok(Box::new(FakeLoop {
            state: Rc::clone(&self.state),
            device: LOOP_DEVICE.to_string(),
            released: false,
        }))
    }
}
