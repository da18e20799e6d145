//! Seen-frame cache.
//!
//! Duplicate suppression keeps two views of the same set: a hash map from
//! frame fingerprint to the highest TTL seen (non-group nodes re-forward a
//! duplicate that arrives with more hops left), and an insertion-ordered
//! queue of fingerprints for eviction. Because insertions happen in
//! non-decreasing time order, a sweep stops at the first unexpired entry.

use crate::types::HashValue;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub struct SeenCache {
    /// Fingerprint -> highest TTL observed for that frame.
    entries: HashMap<HashValue, u32>,
    /// Fingerprints in insertion order, for the expiry sweep.
    by_time: VecDeque<(Instant, HashValue)>,
    expire: Duration,
}

impl SeenCache {
    pub fn new(expire: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            by_time: VecDeque::new(),
            expire,
        }
    }

    /// Record a frame fingerprint. Returns true when the frame is new.
    ///
    /// A duplicate does not refresh the entry's age and does not touch the
    /// stored TTL; raising the TTL is an explicit, separate decision.
    pub fn insert(&mut self, hash: HashValue, ttl: u32, now: Instant) -> bool {
        if self.entries.contains_key(&hash) {
            return false;
        }
        self.entries.insert(hash, ttl);
        self.by_time.push_back((now, hash));
        true
    }

    pub fn contains(&self, hash: HashValue) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Highest TTL seen for a known frame.
    pub fn max_ttl(&self, hash: HashValue) -> Option<u32> {
        self.entries.get(&hash).copied()
    }

    pub fn raise_max_ttl(&mut self, hash: HashValue, ttl: u32) {
        if let Some(stored) = self.entries.get_mut(&hash) {
            *stored = ttl;
        }
    }

    /// Evict entries older than the expiry. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(&(inserted, hash)) = self.by_time.front() {
            if now.duration_since(inserted) <= self.expire {
                break;
            }
            self.by_time.pop_front();
            self.entries.remove(&hash);
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
