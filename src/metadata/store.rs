//! Sled-based metadata store
//!
//! Maps `layer + path` to a [`FileEntry`]. Keys carry the path depth ahead
//! of the path itself so the direct children of a directory form one
//! contiguous key range.

use crate::error::Result;
use crate::metadata::entry::{now_ms, FileEntry};
use crate::metadata::keys::{self, compare_key, entry_key, layer_prefix, prefix_end};
use sled::Tree;
use tracing::debug;

/// One row of a directory scan: layer-independent key and the entry
pub type ScanItem = Result<(Vec<u8>, FileEntry)>;

/// Path to file entry mapping for every layer
#[derive(Clone)]
pub struct MetadataStore {
    tree: Tree,
}

impl MetadataStore {
    pub fn new(tree: Tree) -> Self {
        MetadataStore { tree }
    }

    /// Stamp missing times and serialize an entry for storage
    pub fn encode(entry: &mut FileEntry) -> Result<Vec<u8>> {
        entry.stamp(now_ms());
        Ok(serde_json::to_vec(entry)?)
    }

    /// Store an entry, filling `ctime`/`mtime` with now if unset
    pub fn put(&self, layer: &str, path: &str, entry: &FileEntry) -> Result<()> {
        let mut entry = entry.clone();
        let value = Self::encode(&mut entry)?;
        self.tree.insert(entry_key(layer, path), value)?;
        debug!("Put entry {} in layer {}", path, layer);
        Ok(())
    }

    /// Get the entry for `path` in exactly this layer
    pub fn get(&self, layer: &str, path: &str) -> Result<Option<FileEntry>> {
        match self.tree.get(entry_key(layer, path))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, layer: &str, path: &str) -> Result<()> {
        self.tree.remove(entry_key(layer, path))?;
        debug!("Deleted entry {} in layer {}", path, layer);
        Ok(())
    }

    /// Ordered scan of the direct children of `dir` recorded in `layer`.
    ///
    /// Yields the key without its layer prefix, so scans of different
    /// layers can be merged on it.
    pub fn scan_children(&self, layer: &str, dir: &str) -> impl Iterator<Item = ScanItem> {
        let start = entry_key(layer, &keys::dir_scan_path(dir));
        let end = prefix_end(&start);

        self.tree
            .range(start.clone()..end)
            .filter(move |r| !matches!(r, Ok((k, _)) if &k[..] == start.as_slice()))
            .map(|r| {
                let (key, value) = r?;
                let entry: FileEntry = serde_json::from_slice(&value)?;
                Ok((compare_key(&key).to_vec(), entry))
            })
    }

    /// Every entry recorded in `layer` at or below `prefix`, in key order
    pub fn scan_layer(&self, layer: &str, prefix: &str) -> Result<Vec<(String, FileEntry)>> {
        let start = layer_prefix(layer);
        let end = prefix_end(&start);
        let dir = keys::dir_scan_path(prefix);

        let mut found = Vec::new();
        for item in self.tree.range(start..end) {
            let (key, value) = item?;
            let Some(path) = keys::path_of_key(&key) else {
                continue;
            };
            if path == prefix || path.starts_with(&dir) {
                found.push((path.to_string(), serde_json::from_slice(&value)?));
            }
        }

        Ok(found)
    }

    /// Underlying tree, for multi-tree transactions
    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}
