//! Promote-on-write
//!
//! Before a path is mutated its entry, its inode record and its backing
//! data must live in the mount's writable layer. Promotion copies them up
//! from the layer that currently owns the path. Hard links are promoted as
//! a group so sibling names never keep pointing at the lower copy.
//!
//! Layers allocate inode numbers independently, so the number a lower file
//! carries may already belong to an unrelated file in the writable layer.
//! Such a file is promoted under a freshly allocated number instead.

use super::{LayerStack, Resolved};
use crate::error::{Error, Result};
use crate::fs::backing;
use crate::metadata::{Database, FileEntry, InodeRecord, StagedPromotion};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serializes promotions per inode for one mount
#[derive(Default)]
pub struct Promoter {
    /// Per-inode locks; promotions of different inodes run in parallel
    locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl Promoter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, ino: u64) -> Arc<Mutex<()>> {
        self.locks.entry(ino).or_default().clone()
    }

    /// Drop the lock of `ino` once the caller holds the last outside reference
    fn release(&self, ino: u64, lock: Arc<Mutex<()>>) {
        self.locks
            .remove_if(&ino, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2);
    }

    /// Number of inodes with a live promotion lock
    pub fn active(&self) -> usize {
        self.locks.len()
    }

    /// Discard promotions a previous process left unfinished.
    ///
    /// Must run before any mount of the database starts promoting.
    pub fn recover(db: &Database) -> Result<usize> {
        let stale = db.staged_all()?;
        for (layer, ino, staged) in &stale {
            warn!(
                "Discarding unfinished promotion of inode {} into layer {}",
                ino, layer
            );
            if let Some(data) = &staged.data {
                backing::remove(data)?;
            }
            db.unstage(layer, *ino)?;
        }
        Ok(stale.len())
    }

    /// Ensure `path` has a live entry in the writable layer and return it.
    ///
    /// At most one caller copies a given inode; concurrent callers wait for
    /// it and then find the promoted entry. `alloc_ino` is called only when
    /// the lower inode number is taken in the writable layer.
    pub fn promote<F>(
        &self,
        db: &Database,
        stack: &LayerStack,
        path: &str,
        alloc_ino: F,
    ) -> Result<FileEntry>
    where
        F: FnOnce() -> u64,
    {
        let found = stack.resolve_required(db, path)?;
        if stack.is_writable(&found.layer) {
            return Ok(found.entry);
        }

        let ino = found
            .entry
            .ino
            .ok_or_else(|| Error::InvalidState(format!("Entry {} has no inode", path)))?;

        let lock = self.lock_for(ino);
        let result = {
            let _guard = lock.lock();
            self.promote_locked(db, stack, path, ino, alloc_ino)
        };
        self.release(ino, lock);
        result
    }

    fn promote_locked<F>(
        &self,
        db: &Database,
        stack: &LayerStack,
        path: &str,
        ino: u64,
        alloc_ino: F,
    ) -> Result<FileEntry>
    where
        F: FnOnce() -> u64,
    {
        let found = stack.resolve_required(db, path)?;
        if stack.is_writable(&found.layer) {
            return Ok(found.entry);
        }

        let writable = stack.writable();
        if let Some(staged) = db.staged(writable, ino)? {
            warn!(
                "Discarding unfinished promotion of inode {} into layer {}",
                ino, writable
            );
            if let Some(data) = &staged.data {
                backing::remove(data)?;
            }
            db.unstage(writable, ino)?;
        }

        let lower = db.inodes.get(&found.layer, ino)?.ok_or_else(|| {
            Error::InvalidState(format!(
                "Inode {} of {} missing from layer {}",
                ino, path, found.layer
            ))
        })?;

        match db.inodes.get(writable, ino)? {
            Some(mut record) if record.refs.iter().any(|r| lower.refs.contains(r)) => {
                // A hard link sibling already brought the data up
                let changed = record.add_ref(path);
                let entries = vec![(path.to_string(), found.entry.clone())];
                db.commit_promotion(writable, ino, changed.then_some(&record), &entries)?;
                debug!("Promoted {} onto existing inode {}", path, ino);
                Ok(found.entry)
            }
            Some(_) => {
                let fresh = alloc_ino();
                warn!(
                    "Inode {} of {} belongs to another file in layer {}, promoting as inode {}",
                    ino, path, writable, fresh
                );
                self.copy_up(db, stack, path, &found, &lower, ino, fresh)
            }
            None => self.copy_up(db, stack, path, &found, &lower, ino, ino),
        }
    }

    /// Copy inode `ino` of `found` and its live links into the writable
    /// layer as inode `target`
    #[allow(clippy::too_many_arguments)]
    fn copy_up(
        &self,
        db: &Database,
        stack: &LayerStack,
        path: &str,
        found: &Resolved,
        lower: &InodeRecord,
        ino: u64,
        target: u64,
    ) -> Result<FileEntry> {
        let writable = stack.writable();
        let renumbered = ino != target;
        let retag = |entry: &FileEntry| FileEntry {
            ino: Some(target),
            ..entry.clone()
        };

        let mut refs = Vec::with_capacity(lower.refs.len());
        let mut entries = Vec::with_capacity(lower.refs.len());
        for r in &lower.refs {
            if r == path {
                refs.push(r.clone());
                entries.push((r.clone(), retag(&found.entry)));
                continue;
            }
            // Siblings deleted or replaced in this mount's view drop out of the group
            match stack.resolve(db, r)? {
                Some(sibling) if sibling.entry.ino == Some(ino) => {
                    if !stack.is_writable(&sibling.layer) {
                        refs.push(r.clone());
                        entries.push((r.clone(), retag(&sibling.entry)));
                    } else if !renumbered {
                        refs.push(r.clone());
                    }
                }
                _ => debug!("Hard link {} of inode {} is not live here", r, ino),
            }
        }
        if !refs.iter().any(|r| r == path) {
            refs.push(path.to_string());
            entries.push((path.to_string(), retag(&found.entry)));
        }

        let data = match &lower.data {
            Some(src) => {
                let dst = db.backing_path();
                db.stage(
                    writable,
                    target,
                    &StagedPromotion {
                        data: Some(dst.clone()),
                    },
                )?;
                let special = found
                    .entry
                    .special
                    .then(|| (found.entry.mode.unwrap_or(0), found.entry.rdev.unwrap_or(0)));
                backing::copy(src, &dst, special)?;
                Some(dst)
            }
            None => None,
        };

        let record = InodeRecord { data, refs };
        db.commit_promotion(writable, target, Some(&record), &entries)?;

        info!(
            "Copied up {} (inode {}, {} link(s)) from layer {} into layer {} as inode {}",
            path,
            ino,
            record.refs.len(),
            found.layer,
            writable,
            target
        );
        Ok(retag(&found.entry))
    }
}
