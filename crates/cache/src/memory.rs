//! In-memory pixel cache with size-weighted LRU eviction.
//!
//! Maps cache keys to shared pixel buffers, weighted by their byte size.
//! When an insert would push the cache over capacity, least-recently-used
//! entries are evicted one at a time until the insert fits. Evicted buffers
//! are not freed on the caller's thread: a sole-owned mutable buffer is
//! handed to the reclamation worker for pool enrollment, anything else is
//! dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::buffer::{CacheKey, PixelBuffer};
use crate::reclaim::ReleaseQueue;

/// Statistics about memory-tier usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCacheStats {
    /// Number of entries currently cached.
    pub entry_count: usize,

    /// Total bytes of cached pixel data.
    pub bytes_used: usize,

    /// Maximum bytes allowed.
    pub capacity: usize,

    /// Number of cache hits.
    pub hits: u64,

    /// Number of cache misses.
    pub misses: u64,

    /// Number of entries evicted under capacity pressure.
    pub evictions: u64,
}

impl MemoryCacheStats {
    /// Cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState {
    /// Map from cache key to shared buffer.
    entries: HashMap<CacheKey, Arc<PixelBuffer>>,

    /// Access order: least recently used at the front.
    lru_queue: VecDeque<CacheKey>,

    /// Sum of entry weights in bytes.
    bytes_used: usize,

    capacity: usize,

    stats: MemoryCacheStats,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            bytes_used: 0,
            capacity,
            stats: MemoryCacheStats {
                capacity,
                ..Default::default()
            },
        }
    }

    /// Mark a key as most recently used.
    fn touch(&mut self, key: &CacheKey) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.clone());
    }

    /// Evict the least recently used entry, routing its buffer to `releases`.
    fn evict_lru(&mut self, releases: &ReleaseQueue) -> bool {
        let Some(key) = self.lru_queue.pop_front() else {
            return false;
        };
        if let Some(buffer) = self.entries.remove(&key) {
            self.bytes_used = self.bytes_used.saturating_sub(buffer.byte_size());
            self.stats.evictions += 1;
            trace!(key = %key, bytes = buffer.byte_size(), "evicting entry");
            release_buffer(releases, buffer);
        }
        self.stats.entry_count = self.entries.len();
        self.stats.bytes_used = self.bytes_used;
        true
    }

    /// Evict until `required` extra bytes fit under capacity.
    fn evict_to_fit(&mut self, required: usize, releases: &ReleaseQueue) {
        while self.bytes_used + required > self.capacity && !self.entries.is_empty() {
            if !self.evict_lru(releases) {
                break;
            }
        }
    }
}

/// Route a removed buffer toward reuse.
///
/// Only a sole-owned mutable buffer can ever be decoded into again; it goes
/// to the reclamation worker. An immutable buffer is freed right here, and a
/// buffer still shared with a reader is freed whenever the last reference
/// drops.
fn release_buffer(releases: &ReleaseQueue, buffer: Arc<PixelBuffer>) {
    match Arc::try_unwrap(buffer) {
        Ok(owned) if owned.is_mutable() => releases.release(owned),
        Ok(_) | Err(_) => {}
    }
}

/// Bounded, size-weighted LRU cache of decoded pixel buffers.
///
/// Reads and writes happen on the interaction thread; the mutex also makes
/// the cache safe to share with background prefetchers.
pub struct MemoryPixelCache {
    state: Mutex<CacheState>,
    releases: ReleaseQueue,
}

impl MemoryPixelCache {
    /// Create a cache bounded to `capacity` bytes. Evicted buffers are sent
    /// to `releases` for deferred reclamation.
    pub fn new(capacity: usize, releases: ReleaseQueue) -> Self {
        Self {
            state: Mutex::new(CacheState::new(capacity)),
            releases,
        }
    }

    /// Look up a buffer. A hit promotes the entry to most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<PixelBuffer>> {
        let mut state = self.state.lock().unwrap();
        if let Some(buffer) = state.entries.get(key).cloned() {
            state.touch(key);
            state.stats.hits += 1;
            Some(buffer)
        } else {
            state.stats.misses += 1;
            None
        }
    }

    /// Insert a buffer, evicting least-recently-used entries until it fits.
    ///
    /// Returns the shared handle for the inserted buffer. A buffer whose
    /// weight alone exceeds the whole capacity is returned uncached so the
    /// capacity invariant holds.
    pub fn put(&self, key: CacheKey, buffer: PixelBuffer) -> Arc<PixelBuffer> {
        let weight = buffer.byte_size();
        let buffer = Arc::new(buffer);
        let mut state = self.state.lock().unwrap();

        // Replacing an entry releases the old buffer first.
        if let Some(old) = state.entries.remove(&key) {
            state.bytes_used = state.bytes_used.saturating_sub(old.byte_size());
            state.lru_queue.retain(|k| k != &key);
            release_buffer(&self.releases, old);
        }

        if weight > state.capacity {
            debug!(key = %key, bytes = weight, "buffer exceeds cache capacity, not cached");
            state.stats.entry_count = state.entries.len();
            state.stats.bytes_used = state.bytes_used;
            return buffer;
        }

        // The eviction sends complete before this insert returns; pool
        // availability is still asynchronous.
        state.evict_to_fit(weight, &self.releases);

        state.bytes_used += weight;
        state.entries.insert(key.clone(), buffer.clone());
        state.touch(&key);
        state.stats.entry_count = state.entries.len();
        state.stats.bytes_used = state.bytes_used;
        buffer
    }

    /// Check for a key without promoting it.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }

    /// Remove an entry, handing the buffer to the caller.
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<PixelBuffer>> {
        let mut state = self.state.lock().unwrap();
        let buffer = state.entries.remove(key)?;
        state.bytes_used = state.bytes_used.saturating_sub(buffer.byte_size());
        state.lru_queue.retain(|k| k != key);
        state.stats.entry_count = state.entries.len();
        state.stats.bytes_used = state.bytes_used;
        Some(buffer)
    }

    /// Evict every entry through the regular reclamation route.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        while state.evict_lru(&self.releases) {}
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    /// Current total weight of cached entries in bytes.
    pub fn bytes_used(&self) -> usize {
        self.state.lock().unwrap().bytes_used
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().capacity
    }

    pub fn stats(&self) -> MemoryCacheStats {
        self.state.lock().unwrap().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;
    use crate::pool::ReusePool;
    use crate::reclaim::ReclamationCoordinator;
    use std::thread;
    use std::time::{Duration, Instant};

    /// A cache plus the reclamation plumbing its evictions flow through.
    fn cache_with_pool(capacity: usize) -> (MemoryPixelCache, Arc<ReusePool>, ReclamationCoordinator) {
        let pool = Arc::new(ReusePool::default());
        let coordinator = ReclamationCoordinator::new(pool.clone());
        let cache = MemoryPixelCache::new(capacity, coordinator.release_queue());
        (cache, pool, coordinator)
    }

    /// An Rgb565 buffer whose byte weight is exactly `bytes` (must be even).
    fn buffer_weighing(bytes: usize) -> PixelBuffer {
        assert_eq!(bytes % 2, 0);
        PixelBuffer::new_mutable((bytes / 2) as u32, 1, PixelFormat::Rgb565)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name)
    }

    #[test]
    fn test_basic_put_get() {
        let (cache, _pool, _c) = cache_with_pool(1024);

        cache.put(key("a"), buffer_weighing(64));
        let hit = cache.get(&key("a")).unwrap();
        assert_eq!(hit.byte_size(), 64);
        assert!(cache.get(&key("missing")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_weighted_lru_eviction_order() {
        // Capacity 20: insert A(12), B(6), touch A, insert C(8).
        // B is least recently used and the only eviction needed.
        let (cache, _pool, _c) = cache_with_pool(20);

        cache.put(key("a"), buffer_weighing(12));
        cache.put(key("b"), buffer_weighing(6));
        assert!(cache.get(&key("a")).is_some());

        cache.put(key("c"), buffer_weighing(8));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.bytes_used(), 20);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_capacity_invariant_under_churn() {
        let (cache, _pool, _c) = cache_with_pool(64);

        for i in 0..50 {
            cache.put(key(&format!("k{i}")), buffer_weighing(16));
            assert!(cache.bytes_used() <= 64);
        }
        assert!(cache.stats().evictions > 0);
    }

    #[test]
    fn test_oversized_buffer_is_returned_uncached() {
        let (cache, _pool, _c) = cache_with_pool(16);

        let handle = cache.put(key("big"), buffer_weighing(32));
        assert_eq!(handle.byte_size(), 32);
        assert!(!cache.contains(&key("big")));
        assert_eq!(cache.bytes_used(), 0);
    }

    #[test]
    fn test_update_existing_key_adjusts_weight() {
        let (cache, _pool, _c) = cache_with_pool(64);

        cache.put(key("a"), buffer_weighing(32));
        cache.put(key("a"), buffer_weighing(16));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes_used(), 16);
    }

    #[test]
    fn test_evicted_mutable_buffer_eventually_reaches_pool() {
        let (cache, pool, _c) = cache_with_pool(16);

        cache.put(key("a"), buffer_weighing(16));
        // Second insert forces the first out; its storage should surface in
        // the pool once the worker has processed the release. Availability
        // is asynchronous, so poll.
        cache.put(key("b"), buffer_weighing(16));

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_shared_buffer_is_not_enrolled_for_reuse() {
        let (cache, pool, coordinator) = cache_with_pool(16);

        // Hold the handle across the eviction, as a paint in progress would.
        let held = cache.put(key("a"), buffer_weighing(16));
        cache.put(key("b"), buffer_weighing(16));

        drop(cache);
        coordinator.shutdown();
        assert!(pool.is_empty());
        drop(held);
    }

    #[test]
    fn test_clear_routes_through_reclamation() {
        let (cache, pool, coordinator) = cache_with_pool(64);

        cache.put(key("a"), buffer_weighing(16));
        cache.put(key("b"), buffer_weighing(16));
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.bytes_used(), 0);

        drop(cache);
        coordinator.shutdown();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_remove_hands_buffer_back() {
        let (cache, _pool, _c) = cache_with_pool(64);

        cache.put(key("a"), buffer_weighing(16));
        let removed = cache.remove(&key("a")).unwrap();
        assert_eq!(removed.byte_size(), 16);
        assert!(cache.is_empty());
        assert!(cache.remove(&key("a")).is_none());
    }
}
