//! Domain types shared between `qmpbackup-core` and the CLI front ends.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Disk image format as reported by the hypervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Other,
}

impl ImageFormat {
    pub fn from_monitor_str(s: &str) -> Self {
        match s {
            "qcow2" => ImageFormat::Qcow2,
            "raw" => ImageFormat::Raw,
            _ => ImageFormat::Other,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Qcow2 => write!(f, "qcow2"),
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Other => write!(f, "other"),
        }
    }
}

/// A dirty bitmap as reported by `query-named-block-nodes` /
/// `query-block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapInfo {
    pub name: String,
    pub recording: bool,
    pub persistent: bool,
    pub granularity: u64,
    pub busy: bool,
}

/// One hypervisor block node considered for backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDevice {
    pub node: String,
    pub device: String,
    pub filename: String,
    pub format: ImageFormat,
    pub virtual_size: u64,
    pub has_full_backup: bool,
    pub has_bitmap: bool,
    pub bitmaps: Vec<BitmapInfo>,
    pub qdev: Option<String>,
}

impl BlockDevice {
    /// Directory name for this device under the target root:
    /// the node name, or the bus device id for synthetic nodes whose
    /// name starts with the internal sentinel prefix.
    pub fn directory_name(&self) -> &str {
        if self.node.starts_with(INTERNAL_NODE_PREFIX) && !self.device.is_empty() {
            &self.device
        } else {
            &self.node
        }
    }

    pub fn bitmap_for_uuid(&self, uuid: &uuid::Uuid) -> Option<&BitmapInfo> {
        let suffix = uuid.to_string();
        self.bitmaps
            .iter()
            .find(|b| b.name == bitmap_name(&self.node, &suffix))
    }
}

/// Prefix reserved for nodes the orchestrator itself creates
/// (fleece, CBW filter, snapshot-access, target). Never a real guest
/// device.
pub const INTERNAL_NODE_PREFIX: &str = "qmpbackup-";

/// Name of the persistent per-device, per-chain bitmap.
pub fn bitmap_name(node: &str, uuid: &str) -> String {
    format!("{INTERNAL_NODE_PREFIX}{node}-{uuid}")
}

/// Name of the non-persistent bitmap used for `copy`-level runs.
pub fn copy_bitmap_name(node: &str) -> String {
    format!("{INTERNAL_NODE_PREFIX}copy-{node}")
}

/// Backup level requested by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupLevel {
    Full,
    Inc,
    Copy,
    Auto,
}

impl fmt::Display for BackupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupLevel::Full => write!(f, "full"),
            BackupLevel::Inc => write!(f, "inc"),
            BackupLevel::Copy => write!(f, "copy"),
            BackupLevel::Auto => write!(f, "auto"),
        }
    }
}

/// Resolved level after `auto` has been collapsed. Only the
/// three concrete levels the orchestrator actually executes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedLevel {
    Full,
    Inc,
    Copy,
}

impl ResolvedLevel {
    pub fn file_prefix(self) -> &'static str {
        match self {
            ResolvedLevel::Full => "FULL",
            ResolvedLevel::Inc => "INC",
            ResolvedLevel::Copy => "COPY",
        }
    }
}

/// Per-level attributes table replacing subclassing: whether the
/// bitmap is persistent, whether it is created fresh or reused, the
/// job's sync mode, and whether the bitmap clears on success.
#[derive(Debug, Clone, Copy)]
pub struct LevelProfile {
    pub persistent_bitmap: bool,
    pub reuses_existing_bitmap: bool,
    pub sync_mode: &'static str,
    pub clear_bitmap_on_success: bool,
}

impl ResolvedLevel {
    pub fn profile(self) -> LevelProfile {
        match self {
            ResolvedLevel::Full => LevelProfile {
                persistent_bitmap: true,
                reuses_existing_bitmap: false,
                sync_mode: "full",
                clear_bitmap_on_success: false,
            },
            ResolvedLevel::Inc => LevelProfile {
                persistent_bitmap: true,
                reuses_existing_bitmap: true,
                sync_mode: "incremental",
                clear_bitmap_on_success: true,
            },
            ResolvedLevel::Copy => LevelProfile {
                persistent_bitmap: false,
                reuses_existing_bitmap: false,
                sync_mode: "full",
                clear_bitmap_on_success: false,
            },
        }
    }
}

/// AIO backend for the target blockdev.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AioMode {
    Threads,
    IoUring,
}

impl fmt::Display for AioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AioMode::Threads => write!(f, "threads"),
            AioMode::IoUring => write!(f, "io_uring"),
        }
    }
}

/// One entry in an on-disk restore chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChainEntryKind {
    Full,
    Inc,
    Copy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub path: std::path::PathBuf,
    pub kind: ChainEntryKind,
    pub epoch: i64,
    pub disk_basename: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_name_format() {
        assert_eq!(bitmap_name("drive0", "abc"), "qmpbackup-drive0-abc");
        assert_eq!(copy_bitmap_name("drive0"), "qmpbackup-copy-drive0");
    }

    #[test]
    fn directory_name_falls_back_to_device_for_internal_nodes() {
        let dev = BlockDevice {
            node: "qmpbackup-target-drive0".to_string(),
            device: "drive0".to_string(),
            filename: "/tmp/x.qcow2".to_string(),
            format: ImageFormat::Qcow2,
            virtual_size: 0,
            has_full_backup: false,
            has_bitmap: false,
            bitmaps: vec![],
            qdev: None,
        };
        assert_eq!(dev.directory_name(), "drive0");
    }

    #[test]
    fn resolved_level_profiles_have_expected_attributes() {
        assert!(ResolvedLevel::Full.profile().persistent_bitmap);
        assert!(!ResolvedLevel::Full.profile().reuses_existing_bitmap);
        assert!(ResolvedLevel::Inc.profile().reuses_existing_bitmap);
        assert!(ResolvedLevel::Inc.profile().clear_bitmap_on_success);
        assert!(!ResolvedLevel::Copy.profile().persistent_bitmap);
    }
}
