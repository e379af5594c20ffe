//! Resident-page table: `(volume, page) -> (frame, parent frame)`.
//!
//! Fixed power-of-two bucket array; each bucket is a small vec behind its
//! own `RwLock`, so lookups of different pages rarely contend. Swizzled page
//! ids are never keys here — a swizzled child resolves straight to its frame
//! without touching the table.

use basalt_types::FrameId;
use parking_lot::RwLock;

/// Outcome of [`ResidentTable::insert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    /// The key was free; the entry is in.
    Inserted,
    /// Someone else got there first; their frame is returned.
    Present(FrameId),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: u64,
    frame: FrameId,
    parent: FrameId,
}

/// The table. Sized once at pool construction.
#[derive(Debug)]
pub struct ResidentTable {
    buckets: Vec<RwLock<Vec<Entry>>>,
    mask: usize,
}

impl ResidentTable {
    /// Create with roughly `2 * expected_entries` buckets.
    #[must_use]
    pub fn new(expected_entries: usize) -> Self {
        let count = (expected_entries * 2).next_power_of_two().max(16);
        Self {
            buckets: (0..count).map(|_| RwLock::new(Vec::new())).collect(),
            mask: count - 1,
        }
    }

    #[inline]
    fn bucket(&self, key: u64) -> &RwLock<Vec<Entry>> {
        // Fibonacci hashing spreads sequential page ids across buckets.
        let h = (key.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize;
        &self.buckets[h & self.mask]
    }

    /// Look up `(frame, parent)` for `key`.
    #[must_use]
    pub fn lookup(&self, key: u64) -> Option<(FrameId, FrameId)> {
        self.bucket(key)
            .read()
            .iter()
            .find(|e| e.key == key)
            .map(|e| (e.frame, e.parent))
    }

    /// Insert unless the key is already present.
    pub fn insert_if_absent(&self, key: u64, frame: FrameId, parent: FrameId) -> Insert {
        let mut bucket = self.bucket(key).write();
        if let Some(existing) = bucket.iter().find(|e| e.key == key) {
            return Insert::Present(existing.frame);
        }
        bucket.push(Entry { key, frame, parent });
        Insert::Inserted
    }

    /// Remove the entry only if it still maps to `frame`. Returns whether an
    /// entry was removed.
    pub fn remove_if_matches(&self, key: u64, frame: FrameId) -> bool {
        let mut bucket = self.bucket(key).write();
        if let Some(pos) = bucket.iter().position(|e| e.key == key && e.frame == frame) {
            bucket.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Update the parent hint for `key`. Returns whether the key was found.
    pub fn update_parent(&self, key: u64, parent: FrameId) -> bool {
        let mut bucket = self.bucket(key).write();
        if let Some(entry) = bucket.iter_mut().find(|e| e.key == key) {
            entry.parent = parent;
            true
        } else {
            false
        }
    }

    /// Total entries (slow; diagnostics only).
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn insert_lookup_remove() {
        let table = ResidentTable::new(64);
        let f = FrameId::new(3);
        let p = FrameId::new(9);
        assert_eq!(table.insert_if_absent(42, f, p), Insert::Inserted);
        assert_eq!(table.insert_if_absent(42, FrameId::new(5), p), Insert::Present(f));
        assert_eq!(table.lookup(42), Some((f, p)));

        assert!(!table.remove_if_matches(42, FrameId::new(5)), "wrong frame must not remove");
        assert!(table.remove_if_matches(42, f));
        assert_eq!(table.lookup(42), None);
    }

    #[test]
    fn parent_hint_update() {
        let table = ResidentTable::new(64);
        table.insert_if_absent(7, FrameId::new(1), FrameId::NULL);
        assert!(table.update_parent(7, FrameId::new(4)));
        assert_eq!(table.lookup(7), Some((FrameId::new(1), FrameId::new(4))));
        assert!(!table.update_parent(8, FrameId::new(4)));
    }

    #[test]
    fn concurrent_distinct_keys() {
        let table = Arc::new(ResidentTable::new(1024));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..200u64 {
                    let key = t * 1000 + i;
                    assert_eq!(
                        table.insert_if_absent(key, FrameId::new(key as u32 + 1), FrameId::NULL),
                        Insert::Inserted
                    );
                }
                for i in 0..200u64 {
                    let key = t * 1000 + i;
                    let (frame, _) = table.lookup(key).unwrap();
                    assert_eq!(frame, FrameId::new(key as u32 + 1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 1600);
    }

    #[test]
    fn racing_inserts_one_winner() {
        let table = Arc::new(ResidentTable::new(16));
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let table = Arc::clone(&table);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                matches!(
                    table.insert_if_absent(99, FrameId::new(t + 1), FrameId::NULL),
                    Insert::Inserted
                )
            }));
        }
        let winners: usize = handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum();
        assert_eq!(winners, 1, "exactly one insert must win");
        assert_eq!(table.len(), 1);
    }
}
