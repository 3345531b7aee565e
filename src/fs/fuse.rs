//! FUSE adapter
//!
//! Translates inode-based kernel requests into the path-based operations
//! of a [`Mount`]. Node ids are the stored inode numbers where those are
//! unambiguous; the root is `FUSE_ROOT_ID`.

use super::ops::{millis, FileStat};
use crate::error::{Error, Result};
use crate::metadata::{keys, now_ms};
use crate::mount::{Mount, ROOT_INO};
use fuser::{
    FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// TTL for cached attributes
const TTL: Duration = Duration::from_secs(1);

/// Layer and stored inode number a node stands for
pub type NodeKey = (String, u64);

/// First node id handed out when a stored inode number is already taken
const SYNTHETIC_BASE: u64 = 1 << 48;

#[derive(Debug)]
struct Node {
    /// Name the node is currently reached through; `None` once unlinked
    path: Option<String>,
    key: Option<NodeKey>,
    /// Entry replies not yet balanced by a forget
    lookups: u64,
}

/// Node ids handed to the kernel, learned from lookups.
///
/// A node id is the stored inode number of the file it stands for unless
/// another file, from another layer, already holds that number.
#[derive(Debug)]
pub struct NodeTable {
    nodes: HashMap<u64, Node>,
    keys: HashMap<NodeKey, u64>,
    next_synthetic: u64,
}

impl NodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                path: Some("/".to_string()),
                key: None,
                lookups: 1,
            },
        );
        NodeTable {
            nodes,
            keys: HashMap::new(),
            next_synthetic: SYNTHETIC_BASE,
        }
    }

    pub fn path(&self, node: u64) -> Result<&str> {
        self.nodes
            .get(&node)
            .and_then(|n| n.path.as_deref())
            .ok_or_else(|| Error::NotFound(format!("inode {}", node)))
    }

    /// Path of `name` inside directory node `parent`
    pub fn child(&self, parent: u64, name: &OsStr) -> Result<String> {
        let name = name
            .to_str()
            .ok_or_else(|| Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)))?;
        Ok(keys::child_path(self.path(parent)?, name))
    }

    /// Node already standing for `key`
    pub fn node_of(&self, key: &NodeKey) -> Option<u64> {
        self.keys.get(key).copied()
    }

    /// Path of the node currently holding id `node`, if the id is in use
    pub fn holder(&self, node: u64) -> Option<Option<&str>> {
        self.nodes.get(&node).map(|n| n.path.as_deref())
    }

    pub fn synthetic(&mut self) -> u64 {
        let node = self.next_synthetic;
        self.next_synthetic += 1;
        node
    }

    /// Point `node` at `path` and the file `key` names there
    pub fn bind(&mut self, node: u64, path: String, key: NodeKey) {
        if node == ROOT_INO {
            return;
        }
        let entry = self.nodes.entry(node).or_insert(Node {
            path: None,
            key: None,
            lookups: 0,
        });
        if let Some(old) = entry.key.take() {
            if self.keys.get(&old) == Some(&node) {
                self.keys.remove(&old);
            }
        }
        entry.path = Some(path);
        entry.key = Some(key.clone());
        self.keys.insert(key, node);
    }

    /// The node lost its last name; it stays until the kernel forgets it
    pub fn unbind(&mut self, node: u64) {
        if node == ROOT_INO {
            return;
        }
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.path = None;
        }
    }

    /// Count one entry reply for `node`
    pub fn remember(&mut self, node: u64) {
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.lookups += 1;
        }
    }

    /// Drop `nlookup` references; the node goes away when none are left
    pub fn forget(&mut self, node: u64, nlookup: u64) {
        if node == ROOT_INO {
            return;
        }
        let Some(entry) = self.nodes.get_mut(&node) else {
            return;
        };
        entry.lookups = entry.lookups.saturating_sub(nlookup);
        if entry.lookups > 0 {
            return;
        }
        if let Some(key) = self.nodes.remove(&node).and_then(|n| n.key) {
            if self.keys.get(&key) == Some(&node) {
                self.keys.remove(&key);
            }
        }
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Parent directory of an absolute path
fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn time_ms(time: TimeOrNow) -> i64 {
    match time {
        TimeOrNow::SpecificTime(t) => millis(t),
        TimeOrNow::Now => now_ms(),
    }
}

/// `fuser::Filesystem` over a mount
pub struct StackFs {
    mount: Arc<Mount>,
    nodes: NodeTable,
}

impl StackFs {
    pub fn new(mount: Arc<Mount>) -> Self {
        StackFs {
            mount,
            nodes: NodeTable::new(),
        }
    }

    /// Stat a path and bind it to a node id. Entry replies count as a
    /// lookup; other callers pass `counted = false`.
    fn entry(&mut self, path: String, counted: bool) -> Result<(u64, FileStat)> {
        let stat = self.mount.getattr(&path)?;
        let key = self.mount.identity(&path)?;
        let node = match self.nodes.node_of(&key) {
            Some(node) => node,
            None => self.claim(stat.ino, &key),
        };
        self.nodes.bind(node, path, key);
        if counted {
            self.nodes.remember(node);
        }
        Ok((node, stat))
    }

    /// Node id for a file not bound yet: its stored number, unless a
    /// different live file already holds it
    fn claim(&mut self, ino: u64, key: &NodeKey) -> u64 {
        let taken = match self.nodes.holder(ino) {
            None => false,
            Some(None) => false,
            // Still the same file, reached after promotion or through another link
            Some(Some(path)) => match self.mount.identity(path) {
                Ok(current) => current != *key,
                Err(_) => false,
            },
        };
        if taken {
            self.nodes.synthetic()
        } else {
            ino
        }
    }

    fn lookup_path(&mut self, parent: u64, name: &OsStr) -> Result<(u64, FileStat)> {
        let path = self.nodes.child(parent, name)?;
        self.entry(path, true)
    }

    /// Unlink `path` and move its node to a surviving link, if any
    fn unlink_path(&mut self, path: &str) -> Result<()> {
        let key = self.mount.identity(path)?;
        let links = self.mount.links(path)?;
        self.mount.unlink(path)?;
        self.relink(&key, path, &links);
        Ok(())
    }

    fn relink(&mut self, key: &NodeKey, removed: &str, links: &[String]) {
        let Some(node) = self.nodes.node_of(key) else {
            return;
        };
        if self.nodes.path(node).ok() != Some(removed) {
            return;
        }
        for link in links.iter().filter(|l| l.as_str() != removed) {
            if let Ok(key) = self.mount.identity(link) {
                debug!("Node {} now reached through {}", node, link);
                self.nodes.bind(node, link.clone(), key);
                return;
            }
        }
        self.nodes.unbind(node);
    }

    /// Rename and carry the source node over to its new name
    fn rename_path(&mut self, from: String, to: String) -> Result<()> {
        let moved = self
            .mount
            .identity(&from)
            .ok()
            .and_then(|key| self.nodes.node_of(&key));
        let replaced = self.mount.identity(&to).ok();
        let replaced_links = match &replaced {
            Some(_) => self.mount.links(&to)?,
            None => Vec::new(),
        };

        self.mount.rename(&from, &to)?;

        if let Some(key) = &replaced {
            if self.nodes.node_of(key) != moved {
                self.relink(key, &to, &replaced_links);
            }
        }
        if let Some(node) = moved {
            let key = self.mount.identity(&to)?;
            self.nodes.bind(node, to, key);
        }
        Ok(())
    }

    fn setattr_path(
        &mut self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<FileStat> {
        let path = self.nodes.path(ino)?.to_string();

        if let Some(mode) = mode {
            self.mount.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.mount.chown(&path, uid, gid)?;
        }
        if let Some(size) = size {
            self.mount.truncate(&path, size)?;
        }
        if atime.is_some() || mtime.is_some() {
            let current = self.mount.getattr(&path)?;
            // The kernel's access time lands in the ctime slot
            let ctime = atime.map(time_ms).unwrap_or(current.ctime);
            let mtime = mtime.map(time_ms).unwrap_or(current.mtime);
            self.mount.utimens(&path, ctime, mtime)?;
        }

        self.mount.getattr(&path)
    }

    fn readdir_entries(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>> {
        let path = self.nodes.path(ino)?;
        let parent = parent_of(path);
        let parent_ino = if parent == "/" {
            ROOT_INO
        } else {
            self.mount
                .identity(parent)
                .ok()
                .and_then(|key| self.nodes.node_of(&key))
                .unwrap_or(ino)
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for (name, entry) in self.mount.list_children(path)? {
            let kind = super::ops::file_type(entry.mode.unwrap_or(0));
            entries.push((entry.ino.unwrap_or(0), kind, name));
        }
        Ok(entries)
    }
}

impl Filesystem for StackFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup: parent={}, name={:?}", parent, name);

        match self.lookup_path(parent, name) {
            Ok((node, stat)) => reply.entry(&TTL, &stat.to_fuser(node), 0),
            Err(e) => {
                if !e.is_not_found() {
                    error!("lookup error: {}", e);
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.nodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr: ino={}", ino);

        let result = self
            .nodes
            .path(ino)
            .and_then(|path| self.mount.getattr(path));
        match result {
            Ok(stat) => reply.attr(&TTL, &stat.to_fuser(ino)),
            Err(e) => {
                error!("getattr error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr: ino={}", ino);

        match self.setattr_path(ino, mode, uid, gid, size, atime, mtime) {
            Ok(stat) => reply.attr(&TTL, &stat.to_fuser(ino)),
            Err(e) => {
                error!("setattr error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink: ino={}", ino);

        let result = self
            .nodes
            .path(ino)
            .and_then(|path| self.mount.readlink(path));
        match result {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => {
                error!("readlink error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod: parent={}, name={:?}, mode={:o}", parent, name, mode);

        let result = self.nodes.child(parent, name).and_then(|path| {
            self.mount.mknod(&path, mode, rdev)?;
            self.entry(path, true)
        });
        match result {
            Ok((node, stat)) => reply.entry(&TTL, &stat.to_fuser(node), 0),
            Err(e) => {
                error!("mknod error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir: parent={}, name={:?}, mode={:o}", parent, name, mode);

        let result = self.nodes.child(parent, name).and_then(|path| {
            self.mount.mkdir(&path, mode)?;
            self.entry(path, true)
        });
        match result {
            Ok((node, stat)) => reply.entry(&TTL, &stat.to_fuser(node), 0),
            Err(e) => {
                error!("mkdir error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink: parent={}, name={:?}", parent, name);

        let result = self
            .nodes
            .child(parent, name)
            .and_then(|path| self.unlink_path(&path));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("unlink error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir: parent={}, name={:?}", parent, name);

        let result = self
            .nodes
            .child(parent, name)
            .and_then(|path| self.mount.rmdir(&path));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("rmdir error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink: parent={}, name={:?}, target={:?}", parent, link_name, target);

        let result = self.nodes.child(parent, link_name).and_then(|path| {
            self.mount.symlink(target, &path)?;
            self.entry(path, true)
        });
        match result {
            Ok((node, stat)) => reply.entry(&TTL, &stat.to_fuser(node), 0),
            Err(e) => {
                error!("symlink error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename: parent={}, name={:?}, newparent={}, newname={:?}",
            parent, name, newparent, newname
        );

        let result = self.nodes.child(parent, name).and_then(|from| {
            let to = self.nodes.child(newparent, newname)?;
            self.rename_path(from, to)
        });
        match result {
            Ok(_) => reply.ok(),
            Err(e) => {
                error!("rename error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link: ino={}, newparent={}, newname={:?}", ino, newparent, newname);

        let result = self.nodes.path(ino).map(str::to_string).and_then(|from| {
            let to = self.nodes.child(newparent, newname)?;
            self.mount.link(&from, &to)?;
            self.entry(to, true)
        });
        match result {
            Ok((node, stat)) => reply.entry(&TTL, &stat.to_fuser(node), 0),
            Err(e) => {
                error!("link error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open: ino={}, flags={:#o}", ino, flags);

        let result = self
            .nodes
            .path(ino)
            .and_then(|path| self.mount.open(path, flags));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => {
                error!("open error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read: ino={}, offset={}, size={}", ino, offset, size);

        match self.mount.read(fh, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write: ino={}, offset={}, size={}", ino, offset, data.len());

        match self.mount.write(fh, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release: ino={}, fh={}", ino, fh);

        match self.mount.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("release error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir: ino={}, offset={}", ino, offset);

        let entries = match self.readdir_entries(ino) {
            Ok(entries) => entries,
            Err(e) => {
                error!("readdir error: {}", e);
                reply.error(e.to_errno());
                return;
            }
        };

        for (i, (child, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*child, (i + 1) as i64, *kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create: parent={}, name={:?}, mode={:o}, flags={:#o}",
            parent, name, mode, flags
        );

        let result = self.nodes.child(parent, name).and_then(|path| {
            let fh = self.mount.create(&path, mode)?;
            let (node, stat) = self.entry(path, true)?;
            Ok((fh, node, stat))
        });
        match result {
            Ok((fh, node, stat)) => reply.created(&TTL, &stat.to_fuser(node), 0, fh, 0),
            Err(e) => {
                error!("create error: {}", e);
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(
            1_000_000, // blocks
            500_000,   // bfree
            500_000,   // bavail
            1_000_000, // files
            500_000,   // ffree
            4096,      // bsize
            255,       // namelen
            4096,      // frsize
        );
    }
}
