//! Records stored per layer: file entries and inode records

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Directory type bit
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;

/// Symlink type bit
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;

/// Regular file type bit
pub const S_IFREG: u32 = libc::S_IFREG as u32;

/// Mask of the file type bits
pub const S_IFMT: u32 = libc::S_IFMT as u32;

/// Metadata for one path in one layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// POSIX mode including type bits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,

    /// Inode number; absent on tombstones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ino: Option<u64>,

    /// Size override reported instead of the backing file's size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Device number for special files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdev: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<i64>,

    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,

    /// Device, socket or fifo node
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub special: bool,

    /// Tombstone hiding the path in lower layers
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl FileEntry {
    /// Entry for a new node
    pub fn new(mode: u32, ino: u64) -> Self {
        FileEntry {
            mode: Some(mode),
            ino: Some(ino),
            ..Default::default()
        }
    }

    /// Tombstone entry
    pub fn tombstone() -> Self {
        FileEntry {
            deleted: true,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_some_and(|m| m & S_IFMT == S_IFDIR)
    }

    pub fn is_symlink(&self) -> bool {
        self.mode.is_some_and(|m| m & S_IFMT == S_IFLNK)
    }

    /// Fill unset timestamps with `now_ms`
    pub fn stamp(&mut self, now_ms: i64) {
        if self.ctime.is_none() {
            self.ctime = Some(now_ms);
        }
        if self.mtime.is_none() {
            self.mtime = Some(now_ms);
        }
    }
}

/// Backing data and hard links of one inode within one layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    /// Backing file; absent for directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,

    /// Paths linking this inode, in link order
    #[serde(default)]
    pub refs: Vec<String>,
}

impl InodeRecord {
    pub fn new(data: Option<PathBuf>, path: &str) -> Self {
        InodeRecord {
            data,
            refs: vec![path.to_string()],
        }
    }

    /// Add a link; returns false if it was already present
    pub fn add_ref(&mut self, path: &str) -> bool {
        if self.refs.iter().any(|r| r == path) {
            return false;
        }
        self.refs.push(path.to_string());
        true
    }

    /// Remove a link; returns false if it was not present
    pub fn remove_ref(&mut self, path: &str) -> bool {
        match self.refs.iter().position(|r| r == path) {
            Some(i) => {
                self.refs.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Marker for a promotion whose backing copy has started but not committed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedPromotion {
    /// Backing path being written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,
}

/// Current time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
