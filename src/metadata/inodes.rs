//! Inode records and hard link tracking
//!
//! Maintains, per layer, the mapping from an inode number to its backing
//! data file and the list of paths that link it.

use crate::error::Result;
use crate::metadata::entry::InodeRecord;
use crate::metadata::keys::{inode_key, layer_prefix, lexint_from_hex, prefix_end};
use sled::Tree;
use tracing::debug;

/// Inode tracker using a sled tree
///
/// Keys are `layer!hex(lexint(ino))`, so the highest inode of a layer is
/// the last key of the layer's range.
#[derive(Clone)]
pub struct InodeStore {
    /// Inode records tree
    tree: Tree,
}

impl InodeStore {
    pub fn new(tree: Tree) -> Self {
        InodeStore { tree }
    }

    /// Serialize a record for storage
    pub fn encode(record: &InodeRecord) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    /// Get the record for an inode in exactly this layer
    pub fn get(&self, layer: &str, ino: u64) -> Result<Option<InodeRecord>> {
        match self.tree.get(inode_key(layer, ino))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store the record for an inode
    pub fn put(&self, layer: &str, ino: u64, record: &InodeRecord) -> Result<()> {
        self.tree.insert(inode_key(layer, ino), Self::encode(record)?)?;
        debug!(
            "Saved inode {} in layer {} with {} link(s)",
            ino,
            layer,
            record.refs.len()
        );
        Ok(())
    }

    /// Remove all tracking data for an inode
    pub fn delete(&self, layer: &str, ino: u64) -> Result<()> {
        self.tree.remove(inode_key(layer, ino))?;
        debug!("Removed inode {} from layer {}", ino, layer);
        Ok(())
    }

    /// Highest inode number recorded in a layer, 0 if the layer is empty
    pub fn highest_inode(&self, layer: &str) -> Result<u64> {
        let prefix = layer_prefix(layer);
        let end = prefix_end(&prefix);

        match self.tree.range(prefix.clone()..end).keys().next_back() {
            Some(key) => {
                let key = key?;
                Ok(lexint_from_hex(&key[prefix.len()..]).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    /// Underlying tree, for multi-tree transactions
    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_store() -> InodeStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        InodeStore::new(db.open_tree("inodes").unwrap())
    }

    #[test]
    fn test_put_and_get() {
        let store = test_store();
        let mut record = InodeRecord::new(Some(PathBuf::from("/data/ab/cd/ef")), "/test/path1");
        record.add_ref("/test/path2");
        store.put("1", 100, &record).unwrap();

        let loaded = store.get("1", 100).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("2", 100).unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        store.put("1", 300, &InodeRecord::new(None, "/dir")).unwrap();
        store.delete("1", 300).unwrap();
        assert!(store.get("1", 300).unwrap().is_none());
    }

    #[test]
    fn test_highest_inode_empty_layer() {
        let store = test_store();
        assert_eq!(store.highest_inode("1").unwrap(), 0);
    }

    #[test]
    fn test_highest_inode_is_numeric() {
        let store = test_store();
        for ino in [9, 250, 1024, 1025, 70_000, 300] {
            store.put("1", ino, &InodeRecord::new(None, "/x")).unwrap();
        }
        store.put("2", 999_999, &InodeRecord::new(None, "/y")).unwrap();
        store.put("10", 5_000_000, &InodeRecord::new(None, "/z")).unwrap();

        assert_eq!(store.highest_inode("1").unwrap(), 70_000);
        assert_eq!(store.highest_inode("2").unwrap(), 999_999);
    }

    #[test]
    fn test_persistence() {
        let temp_dir = tempfile::TempDir::new().unwrap();

        {
            let db = sled::open(temp_dir.path()).unwrap();
            let store = InodeStore::new(db.open_tree("inodes").unwrap());
            store.put("1", 700, &InodeRecord::new(None, "/test/path1")).unwrap();
            db.flush().unwrap();
        }

        {
            let db = sled::open(temp_dir.path()).unwrap();
            let store = InodeStore::new(db.open_tree("inodes").unwrap());
            assert_eq!(store.get("1", 700).unwrap().unwrap().refs, vec!["/test/path1"]);
            assert_eq!(store.highest_inode("1").unwrap(), 700);
        }
    }
}
