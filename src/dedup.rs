//! Fixed-capacity FIFO set of recently delivered request ids.
//!
//! The relay may push the same event more than once (after a transport is
//! re-opened, or when several sessions share a socket). The multiplexer runs
//! every inbound [`HostRequest`](crate::models::HostRequest) through a
//! `DedupCache` and only forwards ids it has not seen.
//!
//! Eviction is insertion-ordered: once `capacity` ids are stored, inserting a
//! new id drops the earliest-inserted one regardless of how often it has been
//! looked up since.

// Rust guideline compliant 2026-02

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use crate::models::HostRequestId;

/// Default number of request ids remembered.
pub const DEFAULT_DEDUP_CAPACITY: usize = 3000;

/// Bounded membership set with FIFO eviction.
///
/// `order` and `members` always hold the same ids; `members` answers
/// `contains` in O(1) and `order` decides who is evicted next.
#[derive(Debug)]
pub struct DedupCache<T = HostRequestId> {
    order: VecDeque<T>,
    members: HashSet<T>,
    capacity: usize,
}

impl<T: Clone + Eq + Hash> DedupCache<T> {
    /// Create an empty cache that remembers at most `capacity` ids.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "DedupCache capacity must be > 0");
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            members: HashSet::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// True if `id` was inserted and has not been evicted yet.
    #[must_use]
    pub fn contains(&self, id: &T) -> bool {
        self.members.contains(id)
    }

    /// Remember `id`, evicting the oldest entry when full.
    ///
    /// Returns `false` if `id` was already present (the cache is unchanged).
    pub fn insert(&mut self, id: T) -> bool {
        if self.members.contains(&id) {
            return false;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }

        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Configured maximum number of ids.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget every id.
    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

impl Default for DedupCache<HostRequestId> {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request_id(n: usize) -> HostRequestId {
        HostRequestId::new(format!("event-{n}"), "session", "wss://relay.test/rpc")
    }

    #[test]
    fn test_new_cache_is_empty() {
        let cache: DedupCache = DedupCache::default();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), DEFAULT_DEDUP_CAPACITY);
        assert!(!cache.contains(&request_id(0)));
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = DedupCache::<u32>::new(0);
    }

    #[test]
    fn test_insert_then_contains() {
        let mut cache = DedupCache::default();
        assert!(cache.insert(request_id(1)));
        assert!(cache.contains(&request_id(1)));
        assert!(!cache.contains(&request_id(2)));
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut cache = DedupCache::default();
        assert!(cache.insert(request_id(1)));
        assert!(!cache.insert(request_id(1)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fifo_eviction_at_default_capacity() {
        let mut cache = DedupCache::default();
        for n in 0..=DEFAULT_DEDUP_CAPACITY {
            cache.insert(request_id(n));
        }

        assert_eq!(cache.len(), DEFAULT_DEDUP_CAPACITY);
        assert!(!cache.contains(&request_id(0)), "first id should be evicted");
        for n in 1..=DEFAULT_DEDUP_CAPACITY {
            assert!(cache.contains(&request_id(n)), "id {n} should be retained");
        }
    }

    #[test]
    fn test_eviction_ignores_lookups() {
        let mut cache = DedupCache::new(3);
        cache.insert(1u32);
        cache.insert(2);
        cache.insert(3);

        // Looking up the oldest entry does not refresh it.
        assert!(cache.contains(&1));
        cache.insert(4);

        assert!(!cache.contains(&1));
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
    }

    #[test]
    fn test_reinserting_evicted_id_is_accepted() {
        let mut cache = DedupCache::new(2);
        cache.insert(1u32);
        cache.insert(2);
        cache.insert(3);
        assert!(cache.insert(1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut cache = DedupCache::new(4);
        cache.insert(1u32);
        cache.insert(2);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.contains(&1));
        assert!(cache.insert(1));
    }
}
