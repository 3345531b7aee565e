//! Backing file I/O
//!
//! File contents live outside the database as ordinary files under the
//! data directory. These helpers create, copy and remove them.

use crate::error::Result;
use crate::metadata::{S_IFMT, S_IFREG};
use nix::sys::stat::{Mode, SFlag};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Create (or truncate) a regular backing file with `mode` permissions
pub fn create_file(path: &Path, mode: u32) -> Result<File> {
    ensure_parent(path)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode & 0o7777)
        .open(path)?;
    Ok(file)
}

/// Create a device, fifo or socket node
pub fn make_node(path: &Path, mode: u32, rdev: u32) -> Result<()> {
    ensure_parent(path)?;
    let kind = SFlag::from_bits_truncate((mode & S_IFMT) as libc::mode_t);
    let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
    nix::sys::stat::mknod(path, kind, perm, rdev as libc::dev_t)?;
    Ok(())
}

/// Whether `mode` describes a node that needs `mknod` rather than a plain file
pub fn is_special_mode(mode: u32) -> bool {
    let kind = mode & S_IFMT;
    kind != S_IFREG && kind != 0
}

/// Copy a backing file to a new location.
///
/// Special nodes are recreated with the same mode and device number
/// instead of having their contents read.
pub fn copy(from: &Path, to: &Path, special: Option<(u32, u32)>) -> Result<()> {
    ensure_parent(to)?;
    match special {
        Some((mode, rdev)) => make_node(to, mode, rdev),
        None => {
            fs::copy(from, to)?;
            Ok(())
        }
    }
}

/// Remove a backing file; a file that is already gone is not an error
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Open flags translated into `OpenOptions`
pub fn open(path: &Path, flags: i32) -> Result<File> {
    let accmode = flags & libc::O_ACCMODE;
    let mut options = OpenOptions::new();
    options
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR);

    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    if flags & libc::O_TRUNC != 0 && accmode != libc::O_RDONLY {
        options.truncate(true);
    }

    let passthrough = flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL);
    options.custom_flags(passthrough);

    Ok(options.open(path)?)
}
