//! Bounded LRU cache over loaded node handles.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

use arbor_common::Position;

/// A handle whose resident data can be released under memory pressure.
///
/// Releasing must leave the handle usable: a released handle re-loads its
/// data from storage on the next access.
pub trait Resident {
    /// Drops the resident data held by this handle.
    fn release(&self);
}

/// Bounded cache mapping storage positions to loaded handles.
///
/// When full, inserting a new entry evicts the least recently inserted or
/// refreshed one and releases its resident data. The handle itself is
/// dropped from the map but stays valid wherever else it is held.
pub struct NodeCache<V: Resident> {
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

struct CacheInner<V> {
    entries: HashMap<Position, CacheEntry<V>>,
    /// Recency queue, oldest first. May contain stale entries for positions
    /// that were refreshed later; those are skipped during eviction by
    /// comparing ticks.
    recency: VecDeque<(Position, u64)>,
    tick: u64,
}

struct CacheEntry<V> {
    value: V,
    tick: u64,
}

impl<V: Resident> NodeCache<V> {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                tick: 0,
            }),
        }
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `position` is cached.
    pub fn contains(&self, position: &Position) -> bool {
        self.inner.lock().entries.contains_key(position)
    }

    /// Inserts or refreshes the entry for `position`, evicting the least
    /// recently used entries if the cache is over capacity.
    pub fn put(&self, position: Position, value: V) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(position, CacheEntry { value, tick });
        inner.recency.push_back((position, tick));

        while inner.entries.len() > self.capacity {
            let Some((candidate, queued_tick)) = inner.recency.pop_front() else {
                break;
            };
            let current_tick = inner.entries.get(&candidate).map(|e| e.tick);
            if current_tick == Some(queued_tick) {
                if let Some(entry) = inner.entries.remove(&candidate) {
                    trace!(position = %candidate, "evicting node from cache");
                    entry.value.release();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct TestHandle {
        released: Arc<AtomicBool>,
    }

    impl TestHandle {
        fn new() -> Self {
            Self {
                released: Arc::new(AtomicBool::new(false)),
            }
        }

        fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl Resident for TestHandle {
        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn pos(offset: i64) -> Position {
        Position::new(0, offset)
    }

    #[test]
    fn test_cache_new() {
        let cache: NodeCache<TestHandle> = NodeCache::new(4);
        assert_eq!(cache.capacity(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_capacity_minimum_is_one() {
        let cache: NodeCache<TestHandle> = NodeCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_put_within_capacity_releases_nothing() {
        let cache = NodeCache::new(3);
        let handles: Vec<TestHandle> = (0..3).map(|_| TestHandle::new()).collect();
        for (i, h) in handles.iter().enumerate() {
            cache.put(pos(i as i64), h.clone());
        }

        assert_eq!(cache.len(), 3);
        assert!(handles.iter().all(|h| !h.is_released()));
    }

    #[test]
    fn test_put_over_capacity_evicts_oldest() {
        let cache = NodeCache::new(2);
        let a = TestHandle::new();
        let b = TestHandle::new();
        let c = TestHandle::new();

        cache.put(pos(0), a.clone());
        cache.put(pos(1), b.clone());
        cache.put(pos(2), c.clone());

        assert_eq!(cache.len(), 2);
        assert!(a.is_released());
        assert!(!b.is_released());
        assert!(!c.is_released());
        assert!(!cache.contains(&pos(0)));
        assert!(cache.contains(&pos(1)));
        assert!(cache.contains(&pos(2)));
    }

    #[test]
    fn test_refresh_protects_entry_from_eviction() {
        let cache = NodeCache::new(2);
        let a = TestHandle::new();
        let b = TestHandle::new();
        let c = TestHandle::new();

        cache.put(pos(0), a.clone());
        cache.put(pos(1), b.clone());
        // Refreshing position 0 makes position 1 the oldest.
        cache.put(pos(0), a.clone());
        cache.put(pos(2), c.clone());

        assert!(!a.is_released());
        assert!(b.is_released());
        assert!(cache.contains(&pos(0)));
        assert!(!cache.contains(&pos(1)));
    }

    #[test]
    fn test_replacing_same_position_does_not_grow() {
        let cache = NodeCache::new(2);
        let a = TestHandle::new();
        for _ in 0..10 {
            cache.put(pos(0), a.clone());
        }
        assert_eq!(cache.len(), 1);
        assert!(!a.is_released());
    }

    #[test]
    fn test_eviction_churn() {
        let cache = NodeCache::new(3);
        let handles: Vec<TestHandle> = (0..20).map(|_| TestHandle::new()).collect();
        for (i, h) in handles.iter().enumerate() {
            cache.put(pos(i as i64), h.clone());
        }

        assert_eq!(cache.len(), 3);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(h.is_released(), i < 17, "handle {} release state", i);
        }
    }
}
