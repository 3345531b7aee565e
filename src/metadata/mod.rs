//! Metadata storage module
//!
//! Stores per-layer file entries and inode records in sled. One database
//! holds every layer; each concern gets its own tree and each layer is a
//! key prefix inside it.

mod entry;
mod ids;
mod inodes;
pub mod keys;
mod store;

pub use entry::{
    now_ms, FileEntry, InodeRecord, StagedPromotion, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
pub use ids::LayerIds;
pub use inodes::InodeStore;
pub use store::{MetadataStore, ScanItem};

use crate::error::{Error, Result};
use rand::RngCore;
use sled::transaction::{ConflictableTransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The shared database: every tree the engine uses plus the backing file root
pub struct Database {
    db: Db,
    /// Path to file entry, per layer
    pub metadata: MetadataStore,
    /// Inode to backing data and links, per layer
    pub inodes: InodeStore,
    /// Mountpoint to writable layer id
    pub ids: LayerIds,
    /// In-flight promotions, per layer
    staging: Tree,
    /// Root directory for backing files
    data_dir: PathBuf,
}

impl Database {
    /// Open or create the database under `home`
    pub fn open<P: AsRef<Path>>(home: P) -> Result<Self> {
        let home = home.as_ref();
        std::fs::create_dir_all(home)?;
        let db = sled::open(home.join("db"))?;
        let data_dir = home.join("writeable");

        let database = Self::from_db(db, data_dir)?;
        info!("Database opened at {:?}", home);
        Ok(database)
    }

    /// Create a temporary database (for testing)
    pub fn temporary<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, data_dir.as_ref().to_path_buf())
    }

    fn from_db(db: Db, data_dir: PathBuf) -> Result<Self> {
        Ok(Database {
            metadata: MetadataStore::new(db.open_tree("metadata")?),
            inodes: InodeStore::new(db.open_tree("inodes")?),
            ids: LayerIds::new(db.open_tree("ids")?),
            staging: db.open_tree("staging")?,
            db,
            data_dir,
        })
    }

    /// Fresh backing file path, fanned out by name prefix
    pub fn backing_path(&self) -> PathBuf {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let name = hex::encode(bytes);
        self.data_dir
            .join(&name[0..2])
            .join(&name[2..4])
            .join(&name[4..])
    }

    /// Root directory of backing files
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Marker of an unfinished promotion of `ino` into `layer`
    pub fn staged(&self, layer: &str, ino: u64) -> Result<Option<StagedPromotion>> {
        match self.staging.get(keys::inode_key(layer, ino))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record that a promotion of `ino` into `layer` has started
    pub fn stage(&self, layer: &str, ino: u64, staged: &StagedPromotion) -> Result<()> {
        self.staging
            .insert(keys::inode_key(layer, ino), serde_json::to_vec(staged)?)?;
        // Must hit disk before any bytes are copied
        self.staging.flush()?;
        Ok(())
    }

    /// Every unfinished promotion marker, as `(layer, ino, marker)`
    pub fn staged_all(&self) -> Result<Vec<(String, u64, StagedPromotion)>> {
        let mut markers = Vec::new();
        for item in self.staging.iter() {
            let (key, value) = item?;
            let Some(i) = key.iter().position(|b| *b == keys::SEP) else {
                continue;
            };
            let (Ok(layer), Some(ino)) = (
                std::str::from_utf8(&key[..i]),
                keys::lexint_from_hex(&key[i + 1..]),
            ) else {
                continue;
            };
            markers.push((layer.to_string(), ino, serde_json::from_slice(&value)?));
        }
        Ok(markers)
    }

    pub fn unstage(&self, layer: &str, ino: u64) -> Result<()> {
        self.staging.remove(keys::inode_key(layer, ino))?;
        Ok(())
    }

    /// Commit a promotion: the inode record, the entries and the removal of
    /// the staging marker land together or not at all.
    pub fn commit_promotion(
        &self,
        layer: &str,
        ino: u64,
        record: Option<&InodeRecord>,
        entries: &[(String, FileEntry)],
    ) -> Result<()> {
        let record = record.map(InodeStore::encode).transpose()?;
        let mut rows = Vec::with_capacity(entries.len());
        for (path, entry) in entries {
            let mut entry = entry.clone();
            rows.push((keys::entry_key(layer, path), MetadataStore::encode(&mut entry)?));
        }
        let inode_key = keys::inode_key(layer, ino);

        let result: TransactionResult<(), Error> =
            (self.metadata.tree(), self.inodes.tree(), &self.staging).transaction(
                |(metadata, inodes, staging)| {
                    if let Some(record) = &record {
                        inodes.insert(inode_key.as_slice(), record.as_slice())?;
                    }
                    for (key, value) in &rows {
                        metadata.insert(key.as_slice(), value.as_slice())?;
                    }
                    staging.remove(inode_key.as_slice())?;
                    Ok::<(), ConflictableTransactionError<Error>>(())
                },
            );
        result?;

        debug!(
            "Committed promotion of inode {} into layer {} ({} entries)",
            ino,
            layer,
            entries.len()
        );
        Ok(())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
