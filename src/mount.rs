//! Engine and mount lifecycle
//!
//! The [`Engine`] owns the database shared by every mount of the process.
//! A [`Mount`] is one writable layer stacked on zero or more base layers,
//! optionally served to the kernel through a FUSE session.

use crate::config::{is_valid_layer_id, MIN_INODE};
use crate::error::{Error, Result};
use crate::fs::{FileStat, HandleManager, StackFs};
use crate::layer::{LayerStack, Promoter};
use crate::metadata::{Database, FileEntry};
use fuser::{BackgroundSession, MountOption};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Node id the kernel uses for the mount root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// Lifecycle of a mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    AllocatingId,
    LoadingLayers,
    Ready,
    Serving,
    Unmounted,
}

impl MountState {
    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn advance(self, next: MountState) -> Result<MountState> {
        use MountState::*;
        match (self, next) {
            (AllocatingId, LoadingLayers)
            | (LoadingLayers, Ready)
            | (Ready, Serving)
            | (Ready, Unmounted)
            | (Serving, Unmounted) => Ok(next),
            _ => Err(Error::InvalidState(format!(
                "Mount cannot go from {:?} to {:?}",
                self, next
            ))),
        }
    }
}

/// How to build a mount's layer stack
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Base layers, bottom first
    pub layers: Vec<String>,
    /// Writable layer id; allocated from the mountpoint when absent
    pub id: Option<String>,
}

/// Options for the kernel session
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

impl ServeOptions {
    fn fuse_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName("stackfs".to_string()),
            MountOption::Suid,
            MountOption::Dev,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

/// Process-wide owner of the database
pub struct Engine {
    db: Arc<Database>,
    home: PathBuf,
}

impl Engine {
    /// Open the engine with its database under `home`
    pub fn open<P: AsRef<Path>>(home: P) -> Result<Self> {
        let home = home.as_ref().to_path_buf();
        let db = Database::open(&home)?;
        let recovered = Promoter::recover(&db)?;
        if recovered > 0 {
            info!("Discarded {} unfinished promotion(s)", recovered);
        }
        Ok(Engine {
            db: Arc::new(db),
            home,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Layer id of `mountpoint`, allocating one on first use
    pub fn layer_id<P: AsRef<Path>>(&self, mountpoint: P) -> Result<String> {
        let mountpoint = absolute(mountpoint.as_ref())?;
        let id = self.db.ids.id_for(&mountpoint.to_string_lossy())?;
        Ok(id.to_string())
    }

    /// Every allocated mountpoint and its layer id
    pub fn layer_ids(&self) -> Result<Vec<(String, u64)>> {
        self.db.ids.list()
    }

    /// Build a mount of `options.layers` plus a writable layer at `mountpoint`
    pub fn mount<P: AsRef<Path>>(&self, mountpoint: P, options: MountOptions) -> Result<Arc<Mount>> {
        let mut state = MountState::AllocatingId;

        let mountpoint = absolute(mountpoint.as_ref())?;
        std::fs::create_dir_all(&mountpoint)?;
        let id = match options.id {
            Some(id) => id,
            None => self.layer_id(&mountpoint)?,
        };

        if let Some(bad) = options.layers.iter().chain([&id]).find(|l| !is_valid_layer_id(l)) {
            return Err(Error::InvalidConfig(format!("Invalid layer id {:?}", bad)));
        }

        state = state.advance(MountState::LoadingLayers)?;
        debug!("Loading layers {:?} under layer {}", options.layers, id);

        let stack = LayerStack::new(&options.layers, &id);
        let mut highest = MIN_INODE;
        for layer in stack.layers() {
            highest = highest.max(self.db.inodes.highest_inode(layer)?);
        }

        let mut root = FileStat::from_metadata(&std::fs::metadata(&mountpoint)?);
        root.ino = ROOT_INO;

        state = state.advance(MountState::Ready)?;
        info!(
            "Mount of {:?} ready: layer {} over {:?}, next inode {}",
            mountpoint,
            id,
            stack.lower(),
            highest + 1
        );

        Ok(Arc::new(Mount {
            db: Arc::clone(&self.db),
            id,
            mountpoint,
            stack,
            root,
            next_ino: AtomicU64::new(highest),
            promoter: Promoter::new(),
            handles: HandleManager::new(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            state: Mutex::new(state),
            session: Mutex::new(None),
        }))
    }

    /// Store an entry directly in `layer`
    pub fn put(&self, layer: &str, path: &str, entry: &FileEntry) -> Result<()> {
        self.db.metadata.put(layer, path, entry)
    }

    /// Read an entry directly from `layer`
    pub fn get(&self, layer: &str, path: &str) -> Result<Option<FileEntry>> {
        self.db.metadata.get(layer, path)
    }

    /// Remove an entry directly from `layer`
    pub fn delete(&self, layer: &str, path: &str) -> Result<()> {
        self.db.metadata.delete(layer, path)
    }

    /// Detach whatever filesystem is mounted at `mountpoint`
    pub fn unmount<P: AsRef<Path>>(mountpoint: P) -> Result<()> {
        let mountpoint = mountpoint.as_ref();
        info!("Unmounting {:?}...", mountpoint);

        #[cfg(target_os = "linux")]
        let output = std::process::Command::new("fusermount")
            .arg("-u")
            .arg(mountpoint)
            .output()?;

        #[cfg(not(target_os = "linux"))]
        let output = std::process::Command::new("umount")
            .arg(mountpoint)
            .output()?;

        if output.status.success() {
            info!("Unmounted successfully");
            Ok(())
        } else {
            Err(Error::Internal(format!(
                "Failed to unmount: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// One writable view over a layer stack
pub struct Mount {
    pub(crate) db: Arc<Database>,
    pub(crate) id: String,
    pub(crate) mountpoint: PathBuf,
    pub(crate) stack: LayerStack,
    /// Stat of the mountpoint directory taken at mount time
    pub(crate) root: FileStat,
    pub(crate) next_ino: AtomicU64,
    pub(crate) promoter: Promoter,
    pub(crate) handles: HandleManager,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    state: Mutex<MountState>,
    session: Mutex<Option<BackgroundSession>>,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("mountpoint", &self.mountpoint)
            .field("layers", &self.stack.layers())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Mount {
    /// Writable layer id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn layers(&self) -> &LayerStack {
        &self.stack
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    fn set_state(&self, next: MountState) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.advance(next)?;
        Ok(())
    }

    /// Next unused inode number
    pub(crate) fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Bring `path` into the writable layer before mutating it
    pub fn promote(&self, path: &str) -> Result<FileEntry> {
        self.promoter
            .promote(&self.db, &self.stack, path, || self.alloc_ino())
    }

    /// Layer owning `path` in this view and the inode number it has there
    pub fn identity(&self, path: &str) -> Result<(String, u64)> {
        if path == "/" {
            return Ok((self.id.clone(), ROOT_INO));
        }
        let found = self.stack.resolve_required(&self.db, path)?;
        let ino = found
            .entry
            .ino
            .ok_or_else(|| Error::InvalidState(format!("Entry {} has no inode", path)))?;
        Ok((found.layer, ino))
    }

    /// Every name recorded for the inode behind `path`, `path` included
    pub fn links(&self, path: &str) -> Result<Vec<String>> {
        let (layer, ino) = self.identity(path)?;
        match self.db.inodes.get(&layer, ino)? {
            Some(record) => Ok(record.refs),
            None => Ok(vec![path.to_string()]),
        }
    }

    /// Serve the mount from a background FUSE session
    pub fn serve(self: &Arc<Self>, options: &ServeOptions) -> Result<()> {
        self.set_state(MountState::Serving)?;

        let fs = StackFs::new(Arc::clone(self));
        match fuser::spawn_mount2(fs, &self.mountpoint, &options.fuse_options()) {
            Ok(session) => {
                *self.session.lock() = Some(session);
                info!("Serving layer {} at {:?}", self.id, self.mountpoint);
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = MountState::Ready;
                Err(e.into())
            }
        }
    }

    /// Serve the mount on the calling thread until the kernel session ends
    pub fn serve_foreground(self: &Arc<Self>, options: &ServeOptions) -> Result<()> {
        self.set_state(MountState::Serving)?;
        info!("Serving layer {} at {:?}", self.id, self.mountpoint);

        let fs = StackFs::new(Arc::clone(self));
        let result = fuser::mount2(fs, &self.mountpoint, &options.fuse_options());

        self.set_state(MountState::Unmounted)?;
        self.db.flush()?;
        result.map_err(|e| Error::Internal(e.to_string()))
    }

    /// End the session, if any, and flush the database
    pub fn unmount(&self) -> Result<()> {
        self.set_state(MountState::Unmounted)?;

        // Dropping the session unmounts and joins the FUSE thread
        if let Some(session) = self.session.lock().take() {
            drop(session);
        }

        let open = self.handles.count();
        if open > 0 {
            warn!("Unmounting {:?} with {} open handle(s)", self.mountpoint, open);
        }

        self.db.flush()?;
        info!("Unmounted layer {} from {:?}", self.id, self.mountpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_state_transitions() {
        use MountState::*;
        assert_eq!(AllocatingId.advance(LoadingLayers).unwrap(), LoadingLayers);
        assert_eq!(Ready.advance(Unmounted).unwrap(), Unmounted);
        assert!(Ready.advance(LoadingLayers).is_err());
        assert!(Unmounted.advance(Serving).is_err());
        assert!(Unmounted.advance(Unmounted).is_err());
    }

    #[test]
    fn test_mount_allocates_ids_per_mountpoint() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();

        let a = engine.mount(dir.path().join("a"), MountOptions::default()).unwrap();
        let b = engine.mount(dir.path().join("b"), MountOptions::default()).unwrap();
        assert_eq!(a.id(), "1");
        assert_eq!(b.id(), "2");
        assert!(dir.path().join("a").is_dir());
        assert_eq!(a.state(), MountState::Ready);

        let again = engine.mount(dir.path().join("a"), MountOptions::default()).unwrap();
        assert_eq!(again.id(), "1");
        assert_eq!(engine.layer_ids().unwrap().len(), 2);
    }

    #[test]
    fn test_explicit_id_skips_allocation() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();

        let mount = engine
            .mount(
                dir.path().join("m"),
                MountOptions {
                    layers: vec!["base".to_string()],
                    id: Some("top".to_string()),
                },
            )
            .unwrap();
        assert_eq!(mount.id(), "top");
        assert_eq!(mount.layers().lower(), &["base".to_string()]);
        assert!(engine.layer_ids().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_layer_ids() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();

        let err = engine
            .mount(
                dir.path().join("m"),
                MountOptions {
                    layers: vec!["a!b".to_string()],
                    id: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_inode_counter_starts_above_every_layer() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();
        let db = engine.database();
        db.inodes
            .put("base", 5000, &crate::metadata::InodeRecord::new(None, "/d"))
            .unwrap();

        let fresh = engine.mount(dir.path().join("fresh"), MountOptions::default()).unwrap();
        assert_eq!(fresh.alloc_ino(), MIN_INODE + 1);

        let stacked = engine
            .mount(
                dir.path().join("stacked"),
                MountOptions {
                    layers: vec!["base".to_string()],
                    id: None,
                },
            )
            .unwrap();
        assert_eq!(stacked.alloc_ino(), 5001);
        assert_eq!(stacked.alloc_ino(), 5002);
    }

    #[test]
    fn test_unmount_without_session() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();
        let mount = engine.mount(dir.path().join("m"), MountOptions::default()).unwrap();

        mount.unmount().unwrap();
        assert_eq!(mount.state(), MountState::Unmounted);
        assert!(mount.unmount().is_err());
    }

    #[test]
    fn test_engine_entry_passthrough() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();

        engine
            .put("7", "/x", &FileEntry::new(crate::metadata::S_IFREG | 0o644, 1100))
            .unwrap();
        assert_eq!(engine.get("7", "/x").unwrap().unwrap().ino, Some(1100));
        engine.delete("7", "/x").unwrap();
        assert!(engine.get("7", "/x").unwrap().is_none());
    }

    #[test]
    fn test_open_discards_unfinished_promotions() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        let stale = {
            let engine = Engine::open(&home).unwrap();
            let db = engine.database();
            let stale = db.backing_path();
            crate::fs::backing::create_file(&stale, 0o644).unwrap();
            db.stage(
                "1",
                1100,
                &crate::metadata::StagedPromotion {
                    data: Some(stale.clone()),
                },
            )
            .unwrap();
            db.flush().unwrap();
            stale
        };

        let engine = Engine::open(&home).unwrap();
        assert!(!stale.exists());
        assert!(engine.database().staged("1", 1100).unwrap().is_none());
    }

    #[test]
    fn test_identity_and_links() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path().join("home")).unwrap();
        let mount = engine.mount(dir.path().join("m"), MountOptions::default()).unwrap();

        let fh = mount.create("/a", crate::metadata::S_IFREG | 0o644).unwrap();
        mount.release(fh).unwrap();
        mount.link("/a", "/b").unwrap();

        let (layer, ino) = mount.identity("/b").unwrap();
        assert_eq!(layer, mount.id());
        assert_eq!(ino, mount.getattr("/a").unwrap().ino);
        assert_eq!(mount.identity("/").unwrap().1, ROOT_INO);
        assert_eq!(mount.links("/a").unwrap(), vec!["/a", "/b"]);
        assert!(mount.identity("/nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_serve_options() {
        let options = ServeOptions {
            allow_other: true,
            auto_unmount: false,
        };
        let fuse = options.fuse_options();
        assert!(fuse.contains(&MountOption::AllowOther));
        assert!(!fuse.contains(&MountOption::AutoUnmount));
        assert!(fuse.contains(&MountOption::FSName("stackfs".to_string())));
    }
}
