//! The sharded cache front end.
//!
//! Routes every operation to one of `2^shard_bits` independent shards by a
//! well-mixed hash of the key, collapsing contention to a fixed number of
//! lock domains. The routing hash (`ahash`) is deliberately a different
//! hasher family from the one used inside each shard's index (`hashbrown`'s
//! default builder), so shard selection and bucket selection stay
//! decorrelated.

use core::hash::{BuildHasher, Hash};
use core::num::NonZeroUsize;
use std::collections::BTreeMap;

use ahash::RandomState;
use hashbrown::DefaultHashBuilder;

use crate::config::ShardedLruCacheConfig;
use crate::metrics::{finish_rates, CacheMetrics};
use crate::resizer::IndexResizer;
use crate::shard::LruShard;

/// A concurrent LRU cache sharded across independent lock domains.
///
/// Each shard is a bounded LRU dictionary: an intrusive recency list plus a
/// chaining hash index under one shard mutex. Shards never share locks, and
/// no operation ever holds more than one shard's lock, so operations on
/// different shards proceed fully in parallel. Within a shard, operations
/// are linearizable in mutex-acquisition order.
///
/// Inserts are insert-only: the value stored under an existing key is never
/// overwritten. LRU order is per shard; a `find` promotes its entry, an
/// insert into a full shard evicts that shard's least-recent entry.
///
/// # Example
///
/// ```
/// use sharded_lru::ShardedLruCache;
/// use std::num::NonZeroUsize;
///
/// let cache: ShardedLruCache<i64, [u8; 16]> =
///     ShardedLruCache::new(NonZeroUsize::new(100).unwrap());
///
/// assert!(cache.insert(1, [1u8; 16]));
/// assert_eq!(cache.find(&1), Some([1u8; 16]));
/// assert!(cache.remove(&1));
/// assert!(cache.is_empty());
/// ```
pub struct ShardedLruCache<K, V, S = DefaultHashBuilder> {
    /// Background rehash pool, shared by every shard's index. Declared first
    /// so the workers are joined before the shards (and their indices) go
    /// away.
    resizer: Option<IndexResizer>,
    shards: Box<[LruShard<K, V, S>]>,
    router: RandomState,
    shard_mask: u64,
}

impl<K, V> ShardedLruCache<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache with the default configuration: 16 shards of
    /// `per_shard_capacity` entries each and one background resize worker.
    pub fn new(per_shard_capacity: NonZeroUsize) -> Self {
        Self::with_config(ShardedLruCacheConfig::with_per_shard_capacity(
            per_shard_capacity,
        ))
    }

    /// Creates a cache from an explicit configuration.
    ///
    /// ```
    /// use sharded_lru::{ShardedLruCache, ShardedLruCacheConfig};
    /// use std::num::NonZeroUsize;
    ///
    /// let mut config = ShardedLruCacheConfig::with_per_shard_capacity(
    ///     NonZeroUsize::new(500).unwrap(),
    /// );
    /// config.shard_bits = 2;
    ///
    /// let cache: ShardedLruCache<i64, [u8; 16]> = ShardedLruCache::with_config(config);
    /// assert_eq!(cache.shard_count(), 4);
    /// assert_eq!(cache.capacity(), 2000);
    /// ```
    pub fn with_config(config: ShardedLruCacheConfig) -> Self {
        Self::with_config_and_hasher(config, DefaultHashBuilder::default())
    }
}

impl<K, V, S> ShardedLruCache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Creates a cache with a custom index hasher.
    ///
    /// # Panics
    ///
    /// Panics if `config.shard_bits > 16`.
    pub fn with_config_and_hasher(config: ShardedLruCacheConfig, hasher: S) -> Self {
        assert!(config.shard_bits <= 16, "shard_bits must be at most 16");
        let resizer =
            (config.resize_workers > 0).then(|| IndexResizer::new(config.resize_workers));
        let pool = resizer.as_ref().map(|r| r.shared());

        let shard_count = config.shard_count();
        let shards: Vec<_> = (0..shard_count)
            .map(|_| LruShard::new(&config, hasher.clone(), pool.as_ref()))
            .collect();

        ShardedLruCache {
            resizer,
            shards: shards.into_boxed_slice(),
            router: RandomState::new(),
            shard_mask: (shard_count - 1) as u64,
        }
    }

    #[inline]
    fn shard_for(&self, key: &K) -> &LruShard<K, V, S> {
        let hash = self.router.hash_one(key);
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Looks up a key, promoting it to most recently used in its shard.
    ///
    /// Returns a copy of the stored value, or `None` when the key is absent.
    pub fn find(&self, key: &K) -> Option<V> {
        self.shard_for(key).find(key)
    }

    /// Inserts a key-value pair.
    ///
    /// When the owning shard is full, its least-recent entry is evicted
    /// first. Returns `false` when the key is already present; the stored
    /// value is left untouched (see the crate docs for the
    /// remove-then-insert update pattern).
    pub fn insert(&self, key: K, value: V) -> bool {
        self.shard_for(&key).insert(key, value)
    }

    /// Removes a key. Returns `false` when it is absent.
    pub fn remove(&self, key: &K) -> bool {
        self.shard_for(key).remove(key)
    }

    /// Number of entries across all shards (a snapshot; concurrent writers
    /// may change it immediately).
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// True when no shard holds an entry.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// True when every shard is at capacity.
    pub fn is_full(&self) -> bool {
        self.shards.iter().all(|s| s.is_full())
    }

    /// Total entry capacity across all shards.
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.capacity()).sum()
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Drops every entry in every shard.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    /// Changes the per-shard capacity, evicting least-recent entries from
    /// any shard that now exceeds it.
    pub fn resize(&self, per_shard_capacity: NonZeroUsize) {
        for shard in self.shards.iter() {
            shard.resize(per_shard_capacity);
        }
    }

    /// Shard-by-shard structural check. Test support.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for shard in self.shards.iter() {
            shard.check_invariants();
        }
    }
}

impl<K, V, S> CacheMetrics for ShardedLruCache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut aggregated = BTreeMap::new();
        let mut rehashes = 0.0;
        for shard in self.shards.iter() {
            shard.metrics().accumulate(&mut aggregated);
            rehashes += shard.index_rehashes() as f64;
        }
        aggregated.insert(String::from("index_rehashes"), rehashes);
        aggregated.insert(String::from("len"), self.len() as f64);
        aggregated.insert(String::from("capacity"), self.capacity() as f64);
        finish_rates(&mut aggregated);
        aggregated
    }

    fn algorithm_name(&self) -> &'static str {
        "ShardedLRU"
    }
}

impl<K, V, S> core::fmt::Debug for ShardedLruCache<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShardedLruCache")
            .field("shard_count", &self.shards.len())
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
