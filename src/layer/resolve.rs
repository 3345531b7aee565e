//! Topmost-live-entry resolution across a layer stack

use super::LayerStack;
use crate::error::{Error, Result};
use crate::metadata::{Database, FileEntry};

/// A live entry and the layer it was found in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub entry: FileEntry,
    pub layer: String,
}

impl LayerStack {
    /// Find the topmost layer holding an entry for `path`.
    ///
    /// The first layer with any entry decides: a tombstone there hides every
    /// lower layer, so the path resolves to nothing.
    pub fn resolve(&self, db: &Database, path: &str) -> Result<Option<Resolved>> {
        for layer in self.top_down() {
            if let Some(entry) = db.metadata.get(layer, path)? {
                if entry.deleted {
                    return Ok(None);
                }
                return Ok(Some(Resolved {
                    entry,
                    layer: layer.to_string(),
                }));
            }
        }
        Ok(None)
    }

    /// [`resolve`](Self::resolve), with a missing path as [`Error::NotFound`]
    pub fn resolve_required(&self, db: &Database, path: &str) -> Result<Resolved> {
        self.resolve(db, path)?
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    /// Whether any layer below the writable one holds an entry (live or not)
    pub fn in_lower_layer(&self, db: &Database, path: &str) -> Result<bool> {
        for layer in self.lower() {
            if db.metadata.get(layer, path)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
