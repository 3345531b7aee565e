//! Writable layer id allocation
//!
//! Each mountpoint is assigned a layer id the first time it is mounted.
//! Ids are handed out monotonically from 1 and never change afterwards,
//! so remounting the same mountpoint reopens the same writable layer.

use crate::error::{Error, Result};
use sled::Tree;
use tracing::info;

/// Counter key; mountpoints are absolute paths and never start with NUL
const COUNTER_KEY: &[u8] = b"\0count";

/// Mountpoint to layer id mapping
#[derive(Clone)]
pub struct LayerIds {
    tree: Tree,
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::InvalidState(format!("Corrupt layer id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

impl LayerIds {
    pub fn new(tree: Tree) -> Self {
        LayerIds { tree }
    }

    /// Id assigned to `mountpoint`, allocating the next one if needed
    pub fn id_for(&self, mountpoint: &str) -> Result<u64> {
        if let Some(existing) = self.get(mountpoint)? {
            return Ok(existing);
        }

        let next = self
            .tree
            .update_and_fetch(COUNTER_KEY, |old| {
                let current = old
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })?
            .ok_or_else(|| Error::Internal("Layer id counter vanished".to_string()))?;
        let id = decode_id(&next)?;

        // Another caller may have assigned this mountpoint in the meantime
        match self
            .tree
            .compare_and_swap(mountpoint, None as Option<&[u8]>, Some(&id.to_be_bytes()[..]))?
        {
            Ok(()) => {
                info!("Assigned layer {} to {}", id, mountpoint);
                Ok(id)
            }
            Err(cas) => match cas.current {
                Some(current) => decode_id(&current),
                None => Err(Error::InvalidState(format!(
                    "Layer id for {} disappeared during allocation",
                    mountpoint
                ))),
            },
        }
    }

    /// Id already assigned to `mountpoint`, if any
    pub fn get(&self, mountpoint: &str) -> Result<Option<u64>> {
        match self.tree.get(mountpoint)? {
            Some(bytes) => Ok(Some(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All assigned ids, ordered by mountpoint
    pub fn list(&self) -> Result<Vec<(String, u64)>> {
        let mut ids = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            if &key[..] == COUNTER_KEY {
                continue;
            }
            ids.push((String::from_utf8_lossy(&key).to_string(), decode_id(&value)?));
        }
        Ok(ids)
    }
}
