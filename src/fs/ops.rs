//! Path-based filesystem operations on a mount
//!
//! Reads resolve through the layer stack; anything that mutates a path
//! promotes it into the writable layer first.

use super::backing;
use crate::error::{Error, Result};
use crate::layer::Resolved;
use crate::metadata::{FileEntry, InodeRecord, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::mount::Mount;
use fuser::{FileAttr, FileType};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Block size reported for every node
pub const BLOCK_SIZE: u32 = 4096;

/// Attributes reported for a path, times in milliseconds since the epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u64,
    pub mode: u32,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    /// Attributes of a real file on disk
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let ms = |secs: i64, nsecs: i64| secs * 1000 + nsecs / 1_000_000;
        FileStat {
            ino: meta.ino(),
            mode: meta.mode(),
            size: meta.size(),
            blocks: meta.blocks(),
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: BLOCK_SIZE,
            atime: ms(meta.atime(), meta.atime_nsec()),
            mtime: ms(meta.mtime(), meta.mtime_nsec()),
            ctime: ms(meta.ctime(), meta.ctime_nsec()),
        }
    }

    /// Replace attributes with the ones an entry carries
    fn overlay(&mut self, entry: &FileEntry, uid: u32, gid: u32) {
        if let Some(ino) = entry.ino {
            self.ino = ino;
        }
        if let Some(mode) = entry.mode {
            self.mode = mode;
        }
        if let Some(size) = entry.size {
            self.size = size;
        }
        if let Some(rdev) = entry.rdev {
            self.rdev = rdev;
        }
        if let Some(ctime) = entry.ctime {
            self.ctime = ctime;
        }
        if let Some(mtime) = entry.mtime {
            self.mtime = mtime;
        }
        self.uid = entry.uid.unwrap_or(uid);
        self.gid = entry.gid.unwrap_or(gid);
        self.atime = self.mtime;
        self.blksize = BLOCK_SIZE;
    }

    pub fn kind(&self) -> FileType {
        file_type(self.mode)
    }

    /// Convert to FUSE attributes under node id `ino`
    pub fn to_fuser(&self, ino: u64) -> FileAttr {
        let ctime = system_time(self.ctime);
        FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: system_time(self.atime),
            mtime: system_time(self.mtime),
            ctime,
            crtime: ctime,
            kind: self.kind(),
            perm: (self.mode & 0o7777) as u16,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

/// FUSE node type for a mode
pub fn file_type(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Milliseconds since the epoch as a `SystemTime`
pub fn system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

/// Milliseconds since the epoch of a `SystemTime`
pub fn millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn os_error(code: i32) -> Error {
    Error::Io(std::io::Error::from_raw_os_error(code))
}

impl Mount {
    fn record_of(&self, layer: &str, ino: Option<u64>, path: &str) -> Result<InodeRecord> {
        let ino = ino.ok_or_else(|| Error::InvalidState(format!("Entry {} has no inode", path)))?;
        self.db.inodes.get(layer, ino)?.ok_or_else(|| {
            Error::InvalidState(format!("Inode {} of {} missing from layer {}", ino, path, layer))
        })
    }

    fn data_of(record: &InodeRecord, path: &str) -> Result<PathBuf> {
        record
            .data
            .clone()
            .ok_or_else(|| Error::InvalidState(format!("{} has no backing data", path)))
    }

    /// Drop `path` from the links of `ino`, removing the inode with its last link
    fn drop_link(&self, ino: u64, path: &str) -> Result<()> {
        let writable = self.stack.writable();
        let Some(mut record) = self.db.inodes.get(writable, ino)? else {
            return Ok(());
        };
        record.remove_ref(path);

        if record.refs.is_empty() {
            self.db.inodes.delete(writable, ino)?;
            if let Some(data) = &record.data {
                backing::remove(data)?;
            }
            debug!("Inode {} lost its last link {}", ino, path);
        } else {
            self.db.inodes.put(writable, ino, &record)?;
        }
        Ok(())
    }

    /// Unhook a path that is live in the writable layer from its inode
    fn detach(&self, path: &str) -> Result<()> {
        let writable = self.stack.writable();
        if let Some(entry) = self.db.metadata.get(writable, path)? {
            if let (false, Some(ino)) = (entry.deleted, entry.ino) {
                self.drop_link(ino, path)?;
            }
        }
        Ok(())
    }

    /// New inode with a fresh backing file and an entry at `path`
    fn new_file(&self, path: &str, mode: u32, kind: u32) -> Result<File> {
        self.detach(path)?;
        let writable = self.stack.writable();
        let ino = self.alloc_ino();
        let data = self.db.backing_path();

        let file = backing::create_file(&data, mode)?;
        self.db
            .inodes
            .put(writable, ino, &InodeRecord::new(Some(data), path))?;
        self.db
            .metadata
            .put(writable, path, &FileEntry::new((mode & !S_IFMT) | kind, ino))?;
        Ok(file)
    }

    /// Remove `path` from this mount's view after it was promoted
    fn remove_promoted(&self, path: &str, entry: &FileEntry) -> Result<()> {
        let writable = self.stack.writable();
        if self.stack.in_lower_layer(&self.db, path)? {
            self.db.metadata.put(writable, path, &FileEntry::tombstone())?;
        } else {
            self.db.metadata.delete(writable, path)?;
        }
        if let Some(ino) = entry.ino {
            self.drop_link(ino, path)?;
        }
        Ok(())
    }

    /// Attributes of `path`
    pub fn getattr(&self, path: &str) -> Result<FileStat> {
        debug!("getattr: {}", path);
        if path == "/" {
            return Ok(self.root.clone());
        }

        let Resolved { entry, layer } = self.stack.resolve_required(&self.db, path)?;
        if entry.is_dir() {
            let mut stat = self.root.clone();
            stat.overlay(&entry, self.uid, self.gid);
            return Ok(stat);
        }

        let record = self.record_of(&layer, entry.ino, path)?;
        let data = Self::data_of(&record, path)?;
        let mut stat = FileStat::from_metadata(&fs::symlink_metadata(&data)?);
        stat.overlay(&entry, self.uid, self.gid);
        stat.nlink = record.refs.len() as u32;
        Ok(stat)
    }

    /// Live children of `dir` with their entries
    pub fn list_children(&self, dir: &str) -> Result<Vec<(String, FileEntry)>> {
        self.stack.list_children(&self.db, dir)
    }

    /// Names in `dir`
    pub fn readdir(&self, dir: &str) -> Result<Vec<String>> {
        debug!("readdir: {}", dir);
        Ok(self
            .list_children(dir)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Create a regular file and open it for reading and writing
    pub fn create(&self, path: &str, mode: u32) -> Result<u64> {
        debug!("create: {} mode={:o}", path, mode);
        let file = self.new_file(path, mode, S_IFREG)?;
        Ok(self.handles.open(file))
    }

    /// Create a file, device, fifo or socket node
    pub fn mknod(&self, path: &str, mode: u32, rdev: u32) -> Result<()> {
        debug!("mknod: {} mode={:o} rdev={}", path, mode, rdev);
        if !backing::is_special_mode(mode) {
            self.new_file(path, mode, S_IFREG)?;
            return Ok(());
        }

        self.detach(path)?;
        let writable = self.stack.writable();
        let ino = self.alloc_ino();
        let data = self.db.backing_path();

        backing::make_node(&data, mode, rdev)?;
        self.db
            .inodes
            .put(writable, ino, &InodeRecord::new(Some(data), path))?;
        let entry = FileEntry {
            rdev: Some(rdev),
            special: true,
            ..FileEntry::new(mode, ino)
        };
        self.db.metadata.put(writable, path, &entry)?;
        Ok(())
    }

    /// Open `path` and return a handle id.
    ///
    /// Read-only opens of ordinary files read the owning layer directly;
    /// everything else works on the writable copy.
    pub fn open(&self, path: &str, flags: i32) -> Result<u64> {
        debug!("open: {} flags={:#o}", path, flags);
        let found = self.stack.resolve_required(&self.db, path)?;
        let read_only = flags & libc::O_ACCMODE == libc::O_RDONLY && flags & libc::O_TRUNC == 0;

        let (layer, entry) = if read_only && !found.entry.special {
            (found.layer, found.entry)
        } else {
            let entry = self.promote(path)?;
            (self.stack.writable().to_string(), entry)
        };

        let record = self.record_of(&layer, entry.ino, path)?;
        let file = backing::open(&Self::data_of(&record, path)?, flags)?;
        Ok(self.handles.open(file))
    }

    /// Read up to `size` bytes at `offset`; short only at end of file
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = self.handles.get(fh)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write all of `data` at `offset`
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let file = self.handles.get(fh)?;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Close a handle
    pub fn release(&self, fh: u64) -> Result<()> {
        debug!("release: fh={}", fh);
        self.handles.close(fh)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        debug!("truncate: {} size={}", path, size);
        let entry = self.promote(path)?;
        let record = self.record_of(self.stack.writable(), entry.ino, path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(Self::data_of(&record, path)?)?;
        file.set_len(size)?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink: {}", path);
        let entry = self.promote(path)?;
        self.remove_promoted(path, &entry)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir: {}", path);
        let found = self.stack.resolve_required(&self.db, path)?;
        if !found.entry.is_dir() {
            return Err(os_error(libc::ENOTDIR));
        }
        if !self.list_children(path)?.is_empty() {
            return Err(Error::DirectoryNotEmpty(path.to_string()));
        }

        let entry = self.promote(path)?;
        self.remove_promoted(path, &entry)
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir: {} mode={:o}", path, mode);
        let writable = self.stack.writable();
        let ino = self.alloc_ino();
        self.db
            .inodes
            .put(writable, ino, &InodeRecord::new(None, path))?;
        self.db
            .metadata
            .put(writable, path, &FileEntry::new(mode | S_IFDIR, ino))?;
        Ok(())
    }

    /// Hard link `to` to the inode of `from`
    pub fn link(&self, from: &str, to: &str) -> Result<()> {
        debug!("link: {} -> {}", from, to);
        let entry = self.promote(from)?;
        let ino = entry
            .ino
            .ok_or_else(|| Error::InvalidState(format!("Entry {} has no inode", from)))?;

        let writable = self.stack.writable();
        let replaced = self.db.metadata.get(writable, to)?;
        if replaced.is_some_and(|e| !e.deleted && e.ino != Some(ino)) {
            self.detach(to)?;
        }

        let mut record = self.record_of(writable, Some(ino), from)?;
        self.db.metadata.put(writable, to, &entry)?;
        if record.add_ref(to) {
            self.db.inodes.put(writable, ino, &record)?;
        }
        Ok(())
    }

    /// Link `to`, then unlink `from`
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        debug!("rename: {} -> {}", from, to);
        if from == to {
            self.stack.resolve_required(&self.db, from)?;
            return Ok(());
        }

        self.link(from, to)?;
        self.unlink(from).map_err(|e| Error::PartialRename {
            from: from.to_string(),
            to: to.to_string(),
            source: Box::new(e),
        })
    }

    /// Create a symlink at `path` pointing to `target`
    pub fn symlink(&self, target: &Path, path: &str) -> Result<()> {
        debug!("symlink: {} -> {:?}", path, target);
        let mut file = self.new_file(path, S_IFLNK | 0o755, S_IFLNK)?;
        file.write_all(target.as_os_str().as_bytes())?;
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<PathBuf> {
        debug!("readlink: {}", path);
        let found = self.stack.resolve_required(&self.db, path)?;
        if !found.entry.is_symlink() {
            return Err(os_error(libc::EINVAL));
        }
        let record = self.record_of(&found.layer, found.entry.ino, path)?;
        let target = fs::read(Self::data_of(&record, path)?)?;
        Ok(PathBuf::from(OsString::from_vec(target)))
    }

    /// Change permission bits; the file type is kept
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod: {} mode={:o}", path, mode);
        let mut entry = self.promote(path)?;
        let kind = entry.mode.unwrap_or(0) & S_IFMT;
        entry.mode = Some((mode & !S_IFMT) | kind);
        self.db.metadata.put(self.stack.writable(), path, &entry)
    }

    /// Change owner and/or group
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        debug!("chown: {} uid={:?} gid={:?}", path, uid, gid);
        let mut entry = self.promote(path)?;
        if uid.is_some() {
            entry.uid = uid;
        }
        if gid.is_some() {
            entry.gid = gid;
        }
        self.db.metadata.put(self.stack.writable(), path, &entry)
    }

    /// Set the change and modification times, in milliseconds
    pub fn utimens(&self, path: &str, ctime: i64, mtime: i64) -> Result<()> {
        debug!("utimens: {} ctime={} mtime={}", path, ctime, mtime);
        let mut entry = self.promote(path)?;
        entry.ctime = Some(ctime);
        entry.mtime = Some(mtime);
        self.db.metadata.put(self.stack.writable(), path, &entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{Engine, MountOptions, ROOT_INO};
    use std::os::unix::fs::FileTypeExt;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        engine: Engine,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let engine = Engine::open(dir.path().join("home")).unwrap();
            Fixture { dir, engine }
        }

        fn mount(&self, name: &str, layers: &[&Arc<Mount>]) -> Arc<Mount> {
            let options = MountOptions {
                layers: layers.iter().map(|m| m.id().to_string()).collect(),
                id: None,
            };
            self.engine.mount(self.dir.path().join(name), options).unwrap()
        }
    }

    fn write_file(mount: &Mount, path: &str, data: &[u8]) {
        let fh = match mount.open(path, libc::O_WRONLY | libc::O_TRUNC) {
            Ok(fh) => fh,
            Err(e) if e.is_not_found() => mount.create(path, S_IFREG | 0o644).unwrap(),
            Err(e) => panic!("open {}: {}", path, e),
        };
        mount.write(fh, 0, data).unwrap();
        mount.release(fh).unwrap();
    }

    fn read_file(mount: &Mount, path: &str) -> Vec<u8> {
        let fh = mount.open(path, libc::O_RDONLY).unwrap();
        let data = mount.read(fh, 0, 4096).unwrap();
        mount.release(fh).unwrap();
        data
    }

    #[test]
    fn test_root_attributes() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        let root = m.getattr("/").unwrap();
        assert_eq!(root.ino, ROOT_INO);
        assert_eq!(root.kind(), FileType::Directory);
    }

    #[test]
    fn test_create_write_read() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);

        let fh = m.create("/f.txt", S_IFREG | 0o640).unwrap();
        assert_eq!(m.write(fh, 0, b"hello world").unwrap(), 11);
        assert_eq!(m.read(fh, 6, 100).unwrap(), b"world");
        m.release(fh).unwrap();

        let stat = m.getattr("/f.txt").unwrap();
        assert_eq!(stat.size, 11);
        assert_eq!(stat.mode, S_IFREG | 0o640);
        assert_eq!(stat.nlink, 1);
        assert_eq!(stat.blksize, BLOCK_SIZE);
        assert_eq!(stat.atime, stat.mtime);
        assert_eq!(stat.uid, nix::unistd::getuid().as_raw());
        assert!(stat.ino > crate::config::MIN_INODE);
    }

    #[test]
    fn test_release_twice_fails() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        let fh = m.create("/f", S_IFREG | 0o644).unwrap();
        m.release(fh).unwrap();
        assert!(matches!(m.release(fh), Err(Error::InvalidFileHandle(_))));
        assert!(matches!(m.read(fh, 0, 1), Err(Error::InvalidFileHandle(_))));
    }

    #[test]
    fn test_base_read_leaves_base_alone() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/a", b"base bytes");
        let base_entry = f.engine.get(base.id(), "/a").unwrap().unwrap();

        let top = f.mount("top", &[&base]);
        assert_eq!(read_file(&top, "/a"), b"base bytes");
        assert_eq!(top.getattr("/a").unwrap().size, 10);

        assert!(f.engine.get(top.id(), "/a").unwrap().is_none());
        assert_eq!(f.engine.get(base.id(), "/a").unwrap().unwrap(), base_entry);
    }

    #[test]
    fn test_write_promotes_into_writable_layer() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/a", b"old");
        let ino = f.engine.get(base.id(), "/a").unwrap().unwrap().ino.unwrap();
        let base_record = f.engine.database().inodes.get(base.id(), ino).unwrap();

        let top = f.mount("top", &[&base]);
        write_file(&top, "/a", b"new");

        assert_eq!(read_file(&top, "/a"), b"new");
        assert!(f.engine.get(top.id(), "/a").unwrap().is_some());
        assert!(f.engine.database().inodes.get(top.id(), ino).unwrap().is_some());
        assert_eq!(f.engine.database().inodes.get(base.id(), ino).unwrap(), base_record);

        let other = f.mount("other", &[&base]);
        assert_eq!(read_file(&other, "/a"), b"old");
        assert_eq!(read_file(&base, "/a"), b"old");
    }

    #[test]
    fn test_hardlink_pair_promotes_together() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/a", b"shared");
        base.link("/a", "/b").unwrap();
        assert_eq!(base.getattr("/b").unwrap().nlink, 2);

        let top = f.mount("top", &[&base]);
        write_file(&top, "/a", b"changed");

        let a = f.engine.get(top.id(), "/a").unwrap().unwrap();
        let b = f.engine.get(top.id(), "/b").unwrap().unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(read_file(&top, "/b"), b"changed");
        assert_eq!(read_file(&base, "/b"), b"shared");
    }

    #[test]
    fn test_unlink_hardlinks() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        write_file(&m, "/a", b"data");
        m.link("/a", "/b").unwrap();
        let ino = m.getattr("/a").unwrap().ino;
        let data = f
            .engine
            .database()
            .inodes
            .get(m.id(), ino)
            .unwrap()
            .unwrap()
            .data
            .unwrap();

        m.unlink("/a").unwrap();
        assert!(m.getattr("/a").unwrap_err().is_not_found());
        assert_eq!(read_file(&m, "/b"), b"data");
        assert_eq!(m.getattr("/b").unwrap().nlink, 1);

        m.unlink("/b").unwrap();
        assert!(f.engine.database().inodes.get(m.id(), ino).unwrap().is_none());
        assert!(!data.exists());
        // Nothing below, so no tombstone is left behind
        assert!(f.engine.get(m.id(), "/b").unwrap().is_none());
    }

    #[test]
    fn test_unlink_base_file_writes_tombstone() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/gone", b"x");
        write_file(&base, "/kept", b"y");

        let top = f.mount("top", &[&base]);
        top.unlink("/gone").unwrap();

        assert!(f.engine.get(top.id(), "/gone").unwrap().unwrap().deleted);
        assert!(top.getattr("/gone").unwrap_err().is_not_found());
        assert_eq!(top.readdir("/").unwrap(), vec!["kept"]);
        assert_eq!(base.readdir("/").unwrap(), vec!["gone", "kept"]);

        write_file(&top, "/gone", b"again");
        assert_eq!(read_file(&top, "/gone"), b"again");
        assert_eq!(top.readdir("/").unwrap(), vec!["gone", "kept"]);
    }

    #[test]
    fn test_mkdir_rmdir() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        m.mkdir("/d", 0o755).unwrap();
        write_file(&m, "/d/f", b"1");

        let stat = m.getattr("/d").unwrap();
        assert_eq!(stat.kind(), FileType::Directory);
        assert_eq!(stat.mode, S_IFDIR | 0o755);

        assert!(matches!(m.rmdir("/d"), Err(Error::DirectoryNotEmpty(_))));
        assert_eq!(m.rmdir("/d/f").unwrap_err().to_errno(), libc::ENOTDIR);
        m.unlink("/d/f").unwrap();
        m.rmdir("/d").unwrap();
        assert!(m.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_rmdir_base_directory() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        base.mkdir("/d", 0o755).unwrap();

        let top = f.mount("top", &[&base]);
        top.rmdir("/d").unwrap();
        assert!(top.getattr("/d").unwrap_err().is_not_found());
        assert!(base.getattr("/d").is_ok());
    }

    #[test]
    fn test_rename() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/old", b"content");

        let top = f.mount("top", &[&base]);
        top.rename("/old", "/new").unwrap();
        assert_eq!(top.readdir("/").unwrap(), vec!["new"]);
        assert_eq!(read_file(&top, "/new"), b"content");
        assert_eq!(top.getattr("/new").unwrap().nlink, 1);
        assert_eq!(base.readdir("/").unwrap(), vec!["old"]);
    }

    #[test]
    fn test_rename_replaces_target() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        write_file(&m, "/src", b"src");
        write_file(&m, "/dst", b"dst");
        let dst_ino = m.getattr("/dst").unwrap().ino;

        m.rename("/src", "/dst").unwrap();
        assert_eq!(read_file(&m, "/dst"), b"src");
        assert!(f.engine.database().inodes.get(m.id(), dst_ino).unwrap().is_none());
        assert_eq!(m.readdir("/").unwrap(), vec!["dst"]);
    }

    #[test]
    fn test_rename_missing_source() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        assert!(m.rename("/nope", "/x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_symlink_readlink() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);
        m.symlink(Path::new("../target/file"), "/ln").unwrap();

        assert_eq!(m.readlink("/ln").unwrap(), PathBuf::from("../target/file"));
        let stat = m.getattr("/ln").unwrap();
        assert_eq!(stat.kind(), FileType::Symlink);
        assert_eq!(stat.mode, S_IFLNK | 0o755);
        assert_eq!(stat.size, "../target/file".len() as u64);

        write_file(&m, "/plain", b"x");
        assert_eq!(m.readlink("/plain").unwrap_err().to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_mknod_fifo_and_regular() {
        let f = Fixture::new();
        let m = f.mount("m", &[]);

        m.mknod("/pipe", libc::S_IFIFO as u32 | 0o644, 0).unwrap();
        let entry = f.engine.get(m.id(), "/pipe").unwrap().unwrap();
        assert!(entry.special);
        assert_eq!(m.getattr("/pipe").unwrap().kind(), FileType::NamedPipe);

        m.mknod("/plain", S_IFREG | 0o600, 0).unwrap();
        let entry = f.engine.get(m.id(), "/plain").unwrap().unwrap();
        assert!(!entry.special);
        assert_eq!(m.getattr("/plain").unwrap().size, 0);
    }

    #[test]
    fn test_truncate() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/t", b"0123456789");

        let top = f.mount("top", &[&base]);
        top.truncate("/t", 4).unwrap();
        assert_eq!(read_file(&top, "/t"), b"0123");
        assert_eq!(read_file(&base, "/t"), b"0123456789");
    }

    #[test]
    fn test_chmod_chown_utimens() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/f", b"x");

        let top = f.mount("top", &[&base]);
        top.chmod("/f", 0o600).unwrap();
        assert_eq!(top.getattr("/f").unwrap().mode, S_IFREG | 0o600);
        assert_eq!(base.getattr("/f").unwrap().mode, S_IFREG | 0o644);

        top.chown("/f", Some(4242), None).unwrap();
        let stat = top.getattr("/f").unwrap();
        assert_eq!(stat.uid, 4242);
        assert_eq!(stat.gid, nix::unistd::getgid().as_raw());

        top.utimens("/f", 1_000, 2_000).unwrap();
        let stat = top.getattr("/f").unwrap();
        assert_eq!(stat.ctime, 1_000);
        assert_eq!(stat.mtime, 2_000);
        assert_eq!(stat.atime, 2_000);
    }

    #[test]
    fn test_open_read_only_does_not_promote() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        write_file(&base, "/r", b"r");

        let top = f.mount("top", &[&base]);
        let fh = top.open("/r", libc::O_RDONLY).unwrap();
        top.release(fh).unwrap();
        assert!(f.engine.get(top.id(), "/r").unwrap().is_none());

        let fh = top.open("/r", libc::O_RDWR).unwrap();
        top.release(fh).unwrap();
        assert!(f.engine.get(top.id(), "/r").unwrap().is_some());
    }

    #[test]
    fn test_listing_prefers_topmost() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        base.mkdir("/d", 0o755).unwrap();
        write_file(&base, "/d/a", b"a");
        write_file(&base, "/d/b", b"b");

        let top = f.mount("top", &[&base]);
        top.chmod("/d/b", 0o600).unwrap();
        write_file(&top, "/d/c", b"c");

        let children = top.list_children("/d").unwrap();
        let names: Vec<&str> = children.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(children[1].1.mode, Some(S_IFREG | 0o600));
    }

    #[test]
    fn test_remount_keeps_files_and_inodes() {
        let f = Fixture::new();
        let first = f.mount("m", &[]);
        first.mkdir("/a", 0o755).unwrap();
        let fh = first.create("/a/f.txt", S_IFREG | 0o644).unwrap();
        first.write(fh, 0, b"hi").unwrap();
        first.release(fh).unwrap();
        let used = first.getattr("/a/f.txt").unwrap().ino;
        let id = first.id().to_string();
        first.unmount().unwrap();

        let second = f
            .engine
            .mount(
                f.dir.path().join("m"),
                MountOptions {
                    layers: Vec::new(),
                    id: Some(id.clone()),
                },
            )
            .unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(read_file(&second, "/a/f.txt"), b"hi");
        assert_eq!(second.readdir("/a").unwrap(), vec!["f.txt"]);
        assert!(second.alloc_ino() > used);
    }

    #[test]
    fn test_two_mounts_share_a_base() {
        let f = Fixture::new();
        let a = f.mount("a", &[]);
        write_file(&a, "/x", b"v1");

        let b = f.mount("b", &[&a]);
        write_file(&b, "/x", b"v2");

        assert_eq!(read_file(&a, "/x"), b"v1");
        assert_eq!(read_file(&b, "/x"), b"v2");
    }

    #[test]
    fn test_colliding_inode_numbers_stay_apart() {
        let f = Fixture::new();
        let a = f.mount("a", &[]);
        write_file(&a, "/x", b"x");

        let b = f.mount("b", &[&a]);
        write_file(&b, "/y", b"B-private");
        // Both layers hand out the next number on their own
        write_file(&a, "/z", b"A-z-content");
        assert_eq!(b.getattr("/y").unwrap().ino, b.getattr("/z").unwrap().ino);

        let fh = b.open("/z", libc::O_RDWR).unwrap();
        assert_eq!(b.read(fh, 0, 100).unwrap(), b"A-z-content");
        b.write(fh, 0, b"B-z").unwrap();
        b.release(fh).unwrap();

        assert_eq!(read_file(&b, "/z"), b"B-z-content");
        assert_eq!(read_file(&b, "/y"), b"B-private");
        assert_eq!(read_file(&a, "/z"), b"A-z-content");
        assert_ne!(b.getattr("/y").unwrap().ino, b.getattr("/z").unwrap().ino);

        let y_ino = b.getattr("/y").unwrap().ino;
        let y_record = f.engine.database().inodes.get(b.id(), y_ino).unwrap().unwrap();
        assert_eq!(y_record.refs, vec!["/y"]);
    }

    #[test]
    fn test_special_entry_promoted_on_read_only_open() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        let mode = libc::S_IFIFO as u32 | 0o640;
        base.mknod("/pipe", mode, 0).unwrap();

        let top = f.mount("top", &[&base]);
        assert!(f.engine.get(top.id(), "/pipe").unwrap().is_none());

        let fh = top.open("/pipe", libc::O_RDONLY | libc::O_NONBLOCK).unwrap();
        top.release(fh).unwrap();

        let entry = f.engine.get(top.id(), "/pipe").unwrap().unwrap();
        assert!(entry.special);
        assert_eq!(entry.mode, Some(mode));
        assert_eq!(entry.rdev, Some(0));

        let ino = entry.ino.unwrap();
        let db = f.engine.database();
        let upper = db.inodes.get(top.id(), ino).unwrap().unwrap().data.unwrap();
        let lower = db.inodes.get(base.id(), ino).unwrap().unwrap().data.unwrap();
        assert_ne!(upper, lower);
        let meta = fs::symlink_metadata(&upper).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.rdev(), 0);
        assert_eq!(top.getattr("/pipe").unwrap().kind(), FileType::NamedPipe);
    }

    #[test]
    fn test_chmod_promotes_special_entry() {
        let f = Fixture::new();
        let base = f.mount("base", &[]);
        base.mknod("/pipe", libc::S_IFIFO as u32 | 0o644, 0).unwrap();

        let top = f.mount("top", &[&base]);
        top.chmod("/pipe", 0o600).unwrap();
        assert_eq!(top.getattr("/pipe").unwrap().mode, libc::S_IFIFO as u32 | 0o600);
        assert_eq!(base.getattr("/pipe").unwrap().mode, libc::S_IFIFO as u32 | 0o644);
    }

    #[test]
    fn test_time_conversions() {
        assert_eq!(millis(system_time(1_234_567)), 1_234_567);
        assert_eq!(millis(system_time(-5_000)), -5_000);
        assert_eq!(file_type(libc::S_IFSOCK as u32 | 0o600), FileType::Socket);
        assert_eq!(file_type(0o644), FileType::RegularFile);
    }
}
