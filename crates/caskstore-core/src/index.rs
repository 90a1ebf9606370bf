//! In-memory key directory
//!
//! Maps every live key to the location of its most recent record. The
//! engine owns exactly one `Index` behind its reader-writer lock; merges
//! build a candidate `Index` on the side and swap it in whole.

use hashbrown::HashMap;

use crate::format::KeyInfo;

#[derive(Debug, Default, Clone)]
pub struct Index {
    entries: HashMap<Vec<u8>, KeyInfo>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&KeyInfo> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Point `key` at `info`, returning the location it replaced.
    pub fn insert(&mut self, key: Vec<u8>, info: KeyInfo) -> Option<KeyInfo> {
        self.entries.insert(key, info)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<KeyInfo> {
        self.entries.remove(key)
    }

    /// Replay one record in log order: tombstones remove, values set.
    pub fn apply(&mut self, key: Vec<u8>, info: KeyInfo) {
        if info.is_tombstone() {
            self.entries.remove(key.as_slice());
        } else {
            self.entries.insert(key, info);
        }
    }

    /// True if `key` currently resolves to exactly that record.
    pub fn points_to(&self, key: &[u8], segment_id: u16, serial: u32) -> bool {
        self.entries
            .get(key)
            .map_or(false, |info| info.points_to(segment_id, serial))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current key set
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
