//! Open file handle tracking

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Open backing files keyed by handle id
pub struct HandleManager {
    handles: DashMap<u64, Arc<File>>,
    next_fh: AtomicU64,
}

impl HandleManager {
    pub fn new() -> Self {
        HandleManager {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Register an open file and return its handle id
    pub fn open(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, Arc::new(file));
        fh
    }

    /// Get the file behind a handle
    pub fn get(&self, fh: u64) -> Result<Arc<File>> {
        self.handles
            .get(&fh)
            .map(|f| f.value().clone())
            .ok_or(Error::InvalidFileHandle(fh))
    }

    /// Close a handle; closing it twice is an error
    pub fn close(&self, fh: u64) -> Result<()> {
        self.handles
            .remove(&fh)
            .map(|_| ())
            .ok_or(Error::InvalidFileHandle(fh))
    }

    /// Number of open handles
    pub fn count(&self) -> usize {
        self.handles.len()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn test_handle_lifecycle() {
        let manager = HandleManager::new();

        let fh1 = manager.open(tempfile().unwrap());
        let fh2 = manager.open(tempfile().unwrap());
        assert_ne!(fh1, fh2);
        assert_eq!(manager.count(), 2);

        assert!(manager.get(fh1).is_ok());
        manager.close(fh1).unwrap();
        assert_eq!(manager.count(), 1);

        assert!(matches!(manager.get(fh1), Err(Error::InvalidFileHandle(_))));
        assert!(matches!(manager.close(fh1), Err(Error::InvalidFileHandle(_))));
    }
}
