//! In-memory backend built on a persistent ordered tree.
//!
//! `im::OrdMap` shares structure between clones, so a scan takes an O(1) clone of the map and
//! iterates it without holding the lock. Writers install a new root under the write lock and never
//! disturb scans already in flight.

use std::collections::VecDeque;
use std::ops::Bound;

use im::OrdMap;
use parking_lot::RwLock;

use crate::storage::backend::{
    is_empty_range, BackendIter, BackendResult, KvPair, OrderedBackend, WriteBatch, WriteOp,
};

/// Entries fetched from the tree per refill of a scan.
const SCAN_CHUNK: usize = 64;

/// Volatile [`OrderedBackend`] keeping everything in a persistent B-tree.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<OrdMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw keys currently stored.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl OrderedBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn scan(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>, reverse: bool) -> BackendIter {
        if is_empty_range(&lower, &upper) {
            return Box::new(std::iter::empty());
        }
        let map = self.map.read().clone();
        Box::new(TreeScan {
            map,
            lower,
            upper,
            reverse,
            buffered: VecDeque::with_capacity(SCAN_CHUNK),
            exhausted: false,
        })
    }

    fn atomic_write(&self, batch: WriteBatch) -> BackendResult<()> {
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => {
                    map.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Owned scan over a structural clone of the tree.
///
/// The tree's own range iterator borrows the map, so the scan pages through it instead: each
/// refill reads a chunk and narrows the near bound past the last key it returned.
struct TreeScan {
    map: OrdMap<Vec<u8>, Vec<u8>>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    reverse: bool,
    buffered: VecDeque<KvPair>,
    exhausted: bool,
}

impl TreeScan {
    fn refill(&mut self) {
        if is_empty_range(&self.lower, &self.upper) {
            self.exhausted = true;
            return;
        }

        let range = self.map.range((self.lower.clone(), self.upper.clone()));
        let chunk: Vec<KvPair> = if self.reverse {
            range
                .rev()
                .take(SCAN_CHUNK)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            range
                .take(SCAN_CHUNK)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        if chunk.len() < SCAN_CHUNK {
            self.exhausted = true;
        }
        if let Some((last, _)) = chunk.last() {
            if self.reverse {
                self.upper = Bound::Excluded(last.clone());
            } else {
                self.lower = Bound::Excluded(last.clone());
            }
        }
        self.buffered.extend(chunk);
    }
}

impl Iterator for TreeScan {
    type Item = BackendResult<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buffered.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(iter: BackendIter) -> Vec<Vec<u8>> {
        iter.map(|item| item.unwrap().0).collect()
    }

    fn filled(count: u32) -> MemoryBackend {
        let backend = MemoryBackend::new();
        let mut batch = WriteBatch::new();
        for i in 0..count {
            batch.put(i.to_be_bytes().to_vec(), vec![1]);
        }
        backend.atomic_write(batch).unwrap();
        backend
    }

    #[test]
    fn test_scan_pages_across_chunks() {
        let backend = filled(200);

        let forward = keys(backend.scan(Bound::Unbounded, Bound::Unbounded, false));
        assert_eq!(forward.len(), 200);
        assert!(forward.windows(2).all(|w| w[0] < w[1]));

        let backward = keys(backend.scan(Bound::Unbounded, Bound::Unbounded, true));
        assert_eq!(backward.len(), 200);
        assert!(backward.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_scan_respects_bounds() {
        let backend = filled(10);
        let got = keys(backend.scan(
            Bound::Excluded(2u32.to_be_bytes().to_vec()),
            Bound::Included(5u32.to_be_bytes().to_vec()),
            true,
        ));
        let expected: Vec<Vec<u8>> = [5u32, 4, 3].iter().map(|i| i.to_be_bytes().to_vec()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_scan_is_isolated_from_later_writes() {
        let backend = filled(3);
        let scan = backend.scan(Bound::Unbounded, Bound::Unbounded, false);

        let mut batch = WriteBatch::new();
        batch.delete(0u32.to_be_bytes().to_vec());
        batch.put(9u32.to_be_bytes().to_vec(), vec![2]);
        backend.atomic_write(batch).unwrap();

        assert_eq!(keys(scan).len(), 3);
        assert_eq!(backend.get(&0u32.to_be_bytes()).unwrap(), None);
        assert_eq!(backend.len(), 3);
    }
}
