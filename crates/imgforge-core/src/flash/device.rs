//! Block-device vetting for the flash path.
//!
//! All checks are fail-closed: a device must prove it is a whole block
//! device before a single byte is written. Partition detection combines the
//! naming shape with sysfs metadata when available.

use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use imgforge_domain::{CoreError, ErrorCode};

/// Raw facts about a path, gathered by an inspector.
#[derive(Debug, Clone, Default)]
pub struct DeviceProbe {
    pub exists: bool,
    pub is_block_device: bool,
    /// sysfs says this node is a partition (None when sysfs has no answer).
    pub sysfs_partition: Option<bool>,
    pub size_bytes: Option<u64>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

/// Seam between the flash engine and the host. The system implementation
/// reads stat/sysfs/procfs; tests substitute a fake.
pub trait DeviceInspector: Send + Sync {
    fn probe(&self, path: &Path) -> DeviceProbe;
    fn root_device(&self) -> Option<PathBuf>;
    fn mount_points(&self, path: &Path) -> Vec<String>;
}

/// Validated facts the engine records about the target.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub size_bytes: Option<u64>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

/// Naming-shape partition check for the usual Linux block device families:
/// `sdX1`/`hdX1`/`vdX1`, `nvme0n1p1`, `mmcblk0p1`, `loop0p1`.
#[must_use]
pub fn is_partition_shape(path: &str) -> bool {
    let Some(name) = path.strip_prefix("/dev/") else {
        return false;
    };
    if let Some(rest) = name
        .strip_prefix("sd")
        .or_else(|| name.strip_prefix("hd"))
        .or_else(|| name.strip_prefix("vd"))
    {
        let letters: String = rest.chars().take_while(|c| c.is_ascii_lowercase()).collect();
        let digits = &rest[letters.len()..];
        return !letters.is_empty() && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
    }
    for family in ["nvme", "mmcblk", "loop"] {
        if let Some(rest) = name.strip_prefix(family) {
            // nvme0n1p2 / mmcblk0p1 / loop7p1: a 'p<digits>' tail marks the
            // partition node.
            if let Some(p_at) = rest.rfind('p') {
                let tail = &rest[p_at + 1..];
                let head = &rest[..p_at];
                if !tail.is_empty()
                    && tail.chars().all(|c| c.is_ascii_digit())
                    && head.chars().next().is_some_and(|c| c.is_ascii_digit())
                {
                    return true;
                }
            }
            return false;
        }
    }
    false
}

/// Maps a partition node back to its whole-device node.
#[must_use]
pub fn partition_to_whole(path: &str) -> String {
    if !is_partition_shape(path) {
        return path.to_string();
    }
    let Some(name) = path.strip_prefix("/dev/") else {
        return path.to_string();
    };
    if name.starts_with("sd") || name.starts_with("hd") || name.starts_with("vd") {
        let trimmed = name.trim_end_matches(|c: char| c.is_ascii_digit());
        return format!("/dev/{trimmed}");
    }
    if let Some(p_at) = name.rfind('p') {
        return format!("/dev/{}", &name[..p_at]);
    }
    path.to_string()
}

/// Runs the ordered preflight checks and returns the validated device facts.
/// Every failure is fatal and carries `precondition`, regardless of `force`.
pub fn validate_device(inspector: &dyn DeviceInspector, path: &str) -> Result<DeviceInfo> {
    let probe = inspector.probe(Path::new(path));
    if !probe.exists {
        return Err(CoreError::new(
            ErrorCode::Precondition,
            format!("device {path} does not exist"),
        )
        .into());
    }
    if !probe.is_block_device {
        return Err(CoreError::new(
            ErrorCode::Precondition,
            format!("{path} is not a block device"),
        )
        .into());
    }
    if is_partition_shape(path) || probe.sysfs_partition == Some(true) {
        return Err(CoreError::new(
            ErrorCode::Precondition,
            format!("{path} is a partition; only whole devices are accepted"),
        )
        .into());
    }
    if let Some(root) = inspector.root_device() {
        if root == Path::new(path) {
            return Err(CoreError::new(
                ErrorCode::Precondition,
                format!("{path} is the system root device"),
            )
            .into());
        }
    }
    let mounts = inspector.mount_points(Path::new(path));
    if !mounts.is_empty() {
        return Err(CoreError::new(
            ErrorCode::Precondition,
            format!("{path} has mounted partitions: {}", mounts.join(", ")),
        )
        .into());
    }

    debug!(device = path, size = ?probe.size_bytes, "device validated");
    Ok(DeviceInfo {
        path: path.to_string(),
        size_bytes: probe.size_bytes,
        model: probe.model,
        serial: probe.serial,
    })
}

/// Inspector backed by stat, sysfs, and procfs.
#[derive(Debug, Default, Clone)]
pub struct SysInspector;

impl SysInspector {
    fn sysfs_dir(path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_str()?;
        let dir = PathBuf::from("/sys/class/block").join(name);
        dir.exists().then_some(dir)
    }

    fn read_trimmed(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl DeviceInspector for SysInspector {
    fn probe(&self, path: &Path) -> DeviceProbe {
        let Ok(meta) = fs::metadata(path) else {
            return DeviceProbe::default();
        };
        let is_block_device = meta.file_type().is_block_device();
        let sysfs = Self::sysfs_dir(path);
        let sysfs_partition = sysfs
            .as_ref()
            .map(|dir| dir.join("partition").exists());
        let size_bytes = sysfs.as_ref().and_then(|dir| {
            Self::read_trimmed(&dir.join("size"))
                .and_then(|sectors| sectors.parse::<u64>().ok())
                .map(|sectors| sectors * 512)
        });
        let model = sysfs
            .as_ref()
            .and_then(|dir| Self::read_trimmed(&dir.join("device/model")));
        let serial = sysfs
            .as_ref()
            .and_then(|dir| Self::read_trimmed(&dir.join("device/serial")));
        DeviceProbe {
            exists: true,
            is_block_device,
            sysfs_partition,
            size_bytes,
            model,
            serial,
        }
    }

    fn root_device(&self) -> Option<PathBuf> {
        let mounts = fs::read_to_string("/proc/mounts").ok()?;
        for line in mounts.lines() {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            if mount_point == "/" && device.starts_with("/dev/") {
                return Some(PathBuf::from(partition_to_whole(device)));
            }
        }
        None
    }

    fn mount_points(&self, path: &Path) -> Vec<String> {
        let Some(device_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Vec::new();
        };
        let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
            return Vec::new();
        };
        let mut points = Vec::new();
        for line in mounts.lines() {
            let mut parts = line.split_whitespace();
            let (Some(device), Some(mount_point)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some(mounted_name) = Path::new(device).file_name().and_then(|n| n.to_str())
            else {
                continue;
            };
            let is_partition_of = mounted_name
                .strip_prefix(device_name)
                .is_some_and(|tail| {
                    tail.chars().next().is_some_and(|c| c.is_ascii_digit() || c == 'p')
                });
            if mounted_name == device_name || is_partition_of {
                points.push(mount_point.to_string());
            }
        }
        points
    }
}
