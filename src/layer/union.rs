//! Union of per-layer directory scans
//!
//! Each layer's scan is already sorted by its layer-stripped key. The merge
//! walks all of them at once, emits every key once, and when a key appears
//! in several streams keeps the instance from the earliest stream. Streams
//! are supplied topmost layer first, so the topmost instance wins.

use super::LayerStack;
use crate::error::Result;
use crate::metadata::{keys, Database, FileEntry};
use std::iter::Fuse;

/// Sorted k-way union, deduplicated on key, first stream wins ties
pub struct UnionMerge<I, V>
where
    I: Iterator<Item = Result<(Vec<u8>, V)>>,
{
    streams: Vec<Fuse<I>>,
    heads: Vec<Option<(Vec<u8>, V)>>,
    failed: bool,
}

impl<I, V> UnionMerge<I, V>
where
    I: Iterator<Item = Result<(Vec<u8>, V)>>,
{
    pub fn new(streams: Vec<I>) -> Self {
        let heads = streams.iter().map(|_| None).collect();
        UnionMerge {
            streams: streams.into_iter().map(Iterator::fuse).collect(),
            heads,
            failed: false,
        }
    }

    fn fill(&mut self, i: usize) -> Result<()> {
        if self.heads[i].is_none() {
            if let Some(item) = self.streams[i].next() {
                self.heads[i] = Some(item?);
            }
        }
        Ok(())
    }
}

impl<I, V> Iterator for UnionMerge<I, V>
where
    I: Iterator<Item = Result<(Vec<u8>, V)>>,
{
    type Item = Result<(Vec<u8>, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        for i in 0..self.streams.len() {
            if let Err(e) = self.fill(i) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        // min_by keeps the first of equal keys, i.e. the topmost stream
        let winner = (0..self.heads.len())
            .filter(|i| self.heads[*i].is_some())
            .min_by(|a, b| {
                let ka = self.heads[*a].as_ref().map(|(k, _)| k);
                let kb = self.heads[*b].as_ref().map(|(k, _)| k);
                ka.cmp(&kb)
            })?;

        let (key, value) = self.heads[winner].take()?;
        for head in self.heads.iter_mut() {
            if head.as_ref().is_some_and(|(k, _)| *k == key) {
                *head = None;
            }
        }

        Some(Ok((key, value)))
    }
}

impl LayerStack {
    /// Direct children of `dir` across all layers, with their winning entries.
    ///
    /// No duplicates and no tombstones. Order follows the merged key order.
    pub fn list_children(&self, db: &Database, dir: &str) -> Result<Vec<(String, FileEntry)>> {
        let streams: Vec<_> = self
            .top_down()
            .map(|layer| db.metadata.scan_children(layer, dir))
            .collect();

        let mut children = Vec::new();
        for item in UnionMerge::new(streams) {
            let (key, entry) = item?;
            if entry.deleted {
                continue;
            }
            let key = String::from_utf8_lossy(&key);
            children.push((keys::file_name(&key).to_string(), entry));
        }

        Ok(children)
    }
}
