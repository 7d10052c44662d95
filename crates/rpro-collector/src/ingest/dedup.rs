//! Content-hash index of files already ingested
//!
//! Lives for the lifetime of one collector and is never persisted: after a
//! restart, files are downloaded again and the store's natural keys reject
//! the duplicate rows. Capacity is bounded; once full, the oldest hash is
//! evicted first.

use std::collections::{HashSet, VecDeque};

use tracing::trace;

/// Default number of hashes retained
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded set of SHA-256 hex digests with insertion-order eviction
#[derive(Debug, Clone)]
pub struct DeduplicationIndex {
    hashes: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for DeduplicationIndex {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DeduplicationIndex {
    /// Create an index holding at most `capacity` hashes (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            hashes: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    /// Record a hash; returns `false` if it was already present
    pub fn insert(&mut self, hash: impl Into<String>) -> bool {
        let hash = hash.into();
        if self.hashes.contains(&hash) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                trace!(hash = %evicted, "Evicting oldest file hash");
                self.hashes.remove(&evicted);
            }
        }

        self.order.push_back(hash.clone());
        self.hashes.insert(hash);
        true
    }

    /// Copy of the current hashes, handed to a blocking download session
    pub fn snapshot(&self) -> HashSet<String> {
        self.hashes.clone()
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut index = DeduplicationIndex::default();
        assert!(index.is_empty());
        assert!(index.insert("aa"));
        assert!(!index.insert("aa"));
        assert!(index.contains("aa"));
        assert!(!index.contains("bb"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut index = DeduplicationIndex::with_capacity(2);
        index.insert("first");
        index.insert("second");
        index.insert("third");

        assert_eq!(index.len(), 2);
        assert!(!index.contains("first"));
        assert!(index.contains("second"));
        assert!(index.contains("third"));
    }

    #[test]
    fn test_reinsert_does_not_refresh_position() {
        let mut index = DeduplicationIndex::with_capacity(2);
        index.insert("a");
        index.insert("b");
        index.insert("a");
        index.insert("c");

        assert!(!index.contains("a"));
        assert!(index.contains("b"));
    }

    #[test]
    fn test_snapshot_and_clear() {
        let mut index = DeduplicationIndex::with_capacity(0);
        assert_eq!(index.capacity(), 1);
        index.insert("x");

        let snapshot = index.snapshot();
        index.clear();
        assert!(snapshot.contains("x"));
        assert!(index.is_empty());
    }
}
