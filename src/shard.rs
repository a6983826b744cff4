use core::hash::{BuildHasher, Hash};
use core::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::DefaultHashBuilder;
use parking_lot::Mutex;

use crate::arena::NodeArena;
use crate::buffer::InsertBuffer;
use crate::config::{NodeAllocator, ReaderPolicy, ShardedLruCacheConfig};
use crate::index::HashIndex;
use crate::list::RecencyList;
use crate::metrics::CoreMetrics;
use crate::resizer::ResizerShared;

/// Largest bucket array a shard pre-sizes its index to; beyond this, growth
/// is left to the rehash machinery.
const MAX_INITIAL_INDEX_BUCKETS: usize = 4096;

/// State guarded by the shard mutex: the recency list and the node storage.
struct ShardInner<K, V> {
    list: RecencyList<K, V>,
    arena: NodeArena<K, V>,
}

/// One shard of the cache: a bounded LRU dictionary.
///
/// Composes the recency list and the hash index under the shard mutex. The
/// index holds non-owning handles; nodes are owned by the shard and freed
/// through its arena, always *after* removal from the index so that index
/// readers never see a dangling handle.
///
/// The size counter is atomic so aggregate accessors can snapshot it without
/// taking every shard lock; all mutations happen under the shard mutex.
pub(crate) struct LruShard<K, V, S = DefaultHashBuilder> {
    inner: Mutex<ShardInner<K, V>>,
    index: Arc<HashIndex<K, V, S>>,
    len: AtomicUsize,
    capacity: AtomicUsize,
    policy: ReaderPolicy,
    buffer: Option<Mutex<InsertBuffer<K, V>>>,
    metrics: CoreMetrics,
}

// SAFETY: the raw pointers inside `inner` are owned by this shard and only
// touched under its mutex (or, for value reads, under the index lock
// discipline documented on HashIndex).
unsafe impl<K: Send, V: Send, S: Send> Send for LruShard<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send + Sync> Sync for LruShard<K, V, S> {}

impl<K, V, S> LruShard<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    pub(crate) fn new(
        config: &ShardedLruCacheConfig,
        hasher: S,
        pool: Option<&Arc<ResizerShared>>,
    ) -> Self {
        let capacity = config.per_shard_capacity.get();
        let index = match pool {
            Some(pool) => HashIndex::with_resizer(hasher, Arc::clone(pool)),
            None => HashIndex::with_hasher(hasher),
        };
        index.set_size(capacity.clamp(16, MAX_INITIAL_INDEX_BUCKETS));

        let arena = match config.node_allocator {
            NodeAllocator::Heap => NodeArena::heap(),
            NodeAllocator::Slab => NodeArena::slab(capacity),
        };
        LruShard {
            inner: Mutex::new(ShardInner {
                list: RecencyList::new(),
                arena,
            }),
            index,
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            policy: config.reader_policy,
            buffer: config
                .insert_buffer_capacity
                .map(|cap| Mutex::new(InsertBuffer::new(cap.get()))),
            metrics: CoreMetrics::new(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    pub(crate) fn metrics(&self) -> &CoreMetrics {
        &self.metrics
    }

    pub(crate) fn index_rehashes(&self) -> u64 {
        self.index.rehash_count()
    }

    /// Looks up a key, promoting it to most recently used on a hit.
    pub(crate) fn find(&self, key: &K) -> Option<V> {
        let value = match self.policy {
            ReaderPolicy::Exclusive => self.find_exclusive(key),
            ReaderPolicy::Shared => self.find_shared(key),
        };
        match value {
            Some(_) => self.metrics.record_hit(),
            None => self.metrics.record_miss(),
        }
        value
    }

    fn find_exclusive(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let node = self.index.lookup(key)?;
        // SAFETY: under the shard mutex the node can be neither freed nor
        // unlinked; a handle stored in the index points at a live, linked
        // node of this shard.
        unsafe {
            inner.list.move_to_front(node.as_ptr());
            Some(node.as_ref().value().clone())
        }
    }

    /// Optimistic find: the value is copied under the index reader lock only,
    /// then the front-promotion runs behind a try-lock. Contention, or the
    /// entry vanishing during the lock gap, skips the promotion — weakening
    /// the LRU signal by one access instead of blocking the reader.
    fn find_shared(&self, key: &K) -> Option<V> {
        let value = self.index.lookup_value(key)?;
        if let Some(mut inner) = self.inner.try_lock() {
            // The handle observed before the lock gap may be stale; re-probe
            // under the mutex. An entry still indexed is still linked.
            if let Some(node) = self.index.lookup(key) {
                // SAFETY: as in find_exclusive; move_to_front additionally
                // skips nodes that have gone out of list.
                unsafe { inner.list.move_to_front(node.as_ptr()) };
            }
        }
        Some(value)
    }

    /// Inserts a key-value pair, evicting the least-recent entry first when
    /// the shard is full. Returns false when the key is already present; the
    /// stored value is never overwritten.
    pub(crate) fn insert(&self, key: K, value: V) -> bool {
        if let Some(buffer) = &self.buffer {
            let mut pending = buffer.lock();
            if pending.is_full() {
                let batch = pending.drain();
                let mut inner = self.inner.lock();
                for (k, v) in batch {
                    self.insert_locked(&mut inner, k, v);
                }
            }
            pending.push(key, value);
            // Buffered inserts report success; duplicates are dropped when
            // the batch is applied.
            return true;
        }
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key, value)
    }

    fn insert_locked(&self, inner: &mut ShardInner<K, V>, key: K, value: V) -> bool {
        if self.len.load(Ordering::Relaxed) >= self.capacity.load(Ordering::Relaxed) {
            self.evict_locked(inner);
        }
        let Some(node) = inner.arena.allocate(key.clone(), value) else {
            return false;
        };
        if !self.index.insert(key, node) {
            // SAFETY: the node was just allocated and never linked.
            unsafe { inner.arena.release(node) };
            return false;
        }
        // SAFETY: freshly allocated node, now owned by the index and list.
        unsafe { inner.list.push_front(node.as_ptr()) };
        self.len.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_insertion();
        true
    }

    /// Removes the victim adjacent to the tail sentinel.
    fn evict_locked(&self, inner: &mut ShardInner<K, V>) {
        let Some(victim) = inner.list.pop_back() else {
            return;
        };
        // SAFETY: the victim came off this shard's list and stays allocated
        // until released below.
        unsafe {
            if self.index.remove(victim.as_ref().key()).is_none() {
                tracing::warn!("evicted key was missing from the shard index");
                debug_assert!(false, "evicted key was missing from the shard index");
            }
            inner.arena.release(victim);
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.metrics.record_eviction();
    }

    /// Removes a key. Returns false when it is absent.
    pub(crate) fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        if self.len.load(Ordering::Relaxed) == 0 {
            return false;
        }
        let Some(node) = self.index.remove(key) else {
            return false;
        };
        // SAFETY: the handle was just removed from the index, so no reader
        // can reach it anymore; it is linked into this shard's list.
        unsafe {
            inner.list.unlink(node.as_ptr());
            inner.arena.release(node);
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Drops every entry, including any buffered inserts.
    pub(crate) fn clear(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.lock().clear();
        }
        let mut inner = self.inner.lock();
        self.index.clear();
        while let Some(node) = inner.list.pop_back() {
            // SAFETY: popped off this shard's list; already gone from the
            // index.
            unsafe { inner.arena.release(node) };
        }
        self.len.store(0, Ordering::Relaxed);
    }

    /// Changes the shard capacity, evicting down to the new bound first.
    pub(crate) fn resize(&self, capacity: NonZeroUsize) {
        let mut inner = self.inner.lock();
        let new_capacity = capacity.get();
        if new_capacity < self.capacity.load(Ordering::Relaxed) {
            while self.len.load(Ordering::Relaxed) > new_capacity {
                self.evict_locked(&mut inner);
            }
        }
        self.capacity.store(new_capacity, Ordering::Relaxed);
        inner.arena.reserve(new_capacity);
    }

    /// Structural self-check: list and index agree, links are consistent,
    /// and the size bound holds. Test support.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let inner = self.inner.lock();
        let forward = inner.list.collect_forward();
        let mut backward = inner.list.collect_backward();
        backward.reverse();
        assert_eq!(forward, backward, "forward and backward walks disagree");
        assert_eq!(forward.len(), self.len.load(Ordering::Relaxed));
        assert_eq!(forward.len(), self.index.len());
        assert!(forward.len() <= self.capacity.load(Ordering::Relaxed));
        for &node in &forward {
            let key = unsafe { (*node).key() };
            assert_eq!(
                self.index.lookup(key).map(|n| n.as_ptr()),
                Some(node),
                "index does not resolve a listed key to its node"
            );
        }
    }

    /// Keys from most to least recently used. Test support.
    #[cfg(test)]
    pub(crate) fn keys_mru_order(&self) -> Vec<K> {
        let inner = self.inner.lock();
        inner
            .list
            .collect_forward()
            .iter()
            .map(|&n| unsafe { (*n).key().clone() })
            .collect()
    }
}

impl<K, V, S> Drop for LruShard<K, V, S> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        self.index.clear();
        while let Some(node) = inner.list.pop_back() {
            // SAFETY: teardown owns the shard exclusively.
            unsafe { inner.arena.release(node) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> ShardedLruCacheConfig {
        let mut config = ShardedLruCacheConfig::with_per_shard_capacity(
            NonZeroUsize::new(capacity).unwrap(),
        );
        config.shard_bits = 0;
        config.resize_workers = 0;
        config
    }

    fn shard(capacity: usize) -> LruShard<i64, u64> {
        LruShard::new(&config(capacity), DefaultHashBuilder::default(), None)
    }

    #[test]
    fn insert_find_remove() {
        let shard = shard(4);
        assert!(shard.insert(1, 10));
        assert!(shard.insert(2, 20));
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.find(&1), Some(10));
        assert_eq!(shard.find(&3), None);
        assert!(shard.remove(&1));
        assert!(!shard.remove(&1));
        assert_eq!(shard.find(&1), None);
        assert_eq!(shard.len(), 1);
        shard.check_invariants();
    }

    #[test]
    fn insert_only_never_overwrites() {
        let shard = shard(4);
        assert!(shard.insert(7, 1));
        assert!(!shard.insert(7, 2));
        assert_eq!(shard.find(&7), Some(1));
        assert_eq!(shard.len(), 1);
        // Update-and-promote is remove + insert.
        assert!(shard.remove(&7));
        assert!(shard.insert(7, 2));
        assert_eq!(shard.find(&7), Some(2));
        shard.check_invariants();
    }

    #[test]
    fn eviction_takes_least_recent() {
        let shard = shard(3);
        for key in 0..3 {
            assert!(shard.insert(key, key as u64));
        }
        assert_eq!(shard.keys_mru_order(), vec![2, 1, 0]);
        // Promote 0; the victim becomes 1.
        assert_eq!(shard.find(&0), Some(0));
        assert!(shard.insert(3, 3));
        assert_eq!(shard.len(), 3);
        assert_eq!(shard.find(&1), None);
        assert_eq!(shard.find(&0), Some(0));
        assert_eq!(shard.find(&2), Some(2));
        assert_eq!(shard.find(&3), Some(3));
        shard.check_invariants();
    }

    #[test]
    fn find_promotes_to_front() {
        let shard = shard(3);
        for key in 0..3 {
            shard.insert(key, key as u64);
        }
        shard.find(&0);
        assert_eq!(shard.keys_mru_order(), vec![0, 2, 1]);
        shard.check_invariants();
    }

    #[test]
    fn clear_and_reuse() {
        let shard = shard(8);
        for key in 0..8 {
            shard.insert(key, key as u64);
        }
        shard.clear();
        assert_eq!(shard.len(), 0);
        assert!(shard.is_empty());
        assert_eq!(shard.find(&3), None);
        assert!(shard.insert(100, 1));
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.find(&100), Some(1));
        shard.check_invariants();
    }

    #[test]
    fn resize_shrink_evicts_down() {
        let shard = shard(5);
        for key in 0..5 {
            shard.insert(key, key as u64);
        }
        shard.resize(NonZeroUsize::new(2).unwrap());
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.capacity(), 2);
        // The two most recent survive.
        assert_eq!(shard.find(&4), Some(4));
        assert_eq!(shard.find(&3), Some(3));
        assert_eq!(shard.find(&0), None);
        shard.check_invariants();
    }

    #[test]
    fn resize_grow_allows_more_entries() {
        let shard = shard(2);
        shard.insert(1, 1);
        shard.insert(2, 2);
        shard.resize(NonZeroUsize::new(4).unwrap());
        shard.insert(3, 3);
        shard.insert(4, 4);
        assert_eq!(shard.len(), 4);
        assert!(shard.is_full());
        shard.check_invariants();
    }

    #[test]
    fn slab_allocator_matches_heap_semantics() {
        let mut cfg = config(3);
        cfg.node_allocator = NodeAllocator::Slab;
        let shard: LruShard<i64, u64> =
            LruShard::new(&cfg, DefaultHashBuilder::default(), None);
        for key in 0..5 {
            assert!(shard.insert(key, key as u64 * 7));
        }
        assert_eq!(shard.len(), 3);
        assert_eq!(shard.find(&0), None);
        assert_eq!(shard.find(&1), None);
        for key in 2..5 {
            assert_eq!(shard.find(&key), Some(key as u64 * 7));
        }
        // Shrink then grow the slab through resize.
        shard.resize(NonZeroUsize::new(2).unwrap());
        shard.resize(NonZeroUsize::new(6).unwrap());
        for key in 10..16 {
            assert!(shard.insert(key, key as u64));
        }
        assert_eq!(shard.len(), 6);
        shard.check_invariants();
    }

    #[test]
    fn shared_policy_promotes_uncontended_reads() {
        let mut cfg = config(3);
        cfg.reader_policy = ReaderPolicy::Shared;
        let shard: LruShard<i64, u64> =
            LruShard::new(&cfg, DefaultHashBuilder::default(), None);
        for key in 0..3 {
            shard.insert(key, key as u64);
        }
        assert_eq!(shard.find(&0), Some(0));
        // No contention here, so the promotion must have landed.
        assert_eq!(shard.keys_mru_order(), vec![0, 2, 1]);
        shard.insert(3, 3);
        assert_eq!(shard.find(&1), None);
        shard.check_invariants();
    }

    #[test]
    fn buffered_inserts_apply_in_batches() {
        let mut cfg = config(16);
        cfg.insert_buffer_capacity = NonZeroUsize::new(4);
        let shard: LruShard<i64, u64> =
            LruShard::new(&cfg, DefaultHashBuilder::default(), None);
        for key in 0..4 {
            assert!(shard.insert(key, key as u64));
        }
        // All four are still pending: invisible to find and len.
        assert_eq!(shard.len(), 0);
        assert_eq!(shard.find(&0), None);
        // The fifth insert flushes the full batch first.
        assert!(shard.insert(4, 4));
        assert_eq!(shard.len(), 4);
        for key in 0..4 {
            assert_eq!(shard.find(&key), Some(key as u64));
        }
        assert_eq!(shard.find(&4), None);
        shard.check_invariants();
    }

    #[test]
    fn buffered_duplicates_are_dropped_on_apply() {
        let mut cfg = config(16);
        cfg.insert_buffer_capacity = NonZeroUsize::new(2);
        let shard: LruShard<i64, u64> =
            LruShard::new(&cfg, DefaultHashBuilder::default(), None);
        assert!(shard.insert(1, 10));
        assert!(shard.insert(1, 99));
        // Flush by filling the buffer again.
        shard.insert(2, 20);
        shard.insert(3, 30);
        shard.insert(4, 40);
        assert_eq!(shard.find(&1), Some(10));
        assert_eq!(shard.len(), 3);
        shard.check_invariants();
    }

    #[test]
    fn clear_discards_buffered_inserts() {
        let mut cfg = config(16);
        cfg.insert_buffer_capacity = NonZeroUsize::new(8);
        let shard: LruShard<i64, u64> =
            LruShard::new(&cfg, DefaultHashBuilder::default(), None);
        shard.insert(1, 10);
        shard.clear();
        // Force a flush cycle; the discarded entry must not resurface.
        for key in 10..19 {
            shard.insert(key, key as u64);
        }
        assert_eq!(shard.find(&1), None);
        shard.check_invariants();
    }

    #[test]
    fn empty_shard_remove_and_find() {
        let shard = shard(2);
        assert!(!shard.remove(&1));
        assert_eq!(shard.find(&1), None);
        assert!(shard.is_empty());
        assert!(!shard.is_full());
        shard.check_invariants();
    }
}
